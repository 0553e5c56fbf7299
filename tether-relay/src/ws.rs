use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use warp::ws::{Message, WebSocket};
use warp::Filter;

use crate::dispatcher::Inbound;
use crate::peer::{stopped, ChannelPeer, Outbound, Peer, PeerId, CHANNEL_BUFFER_SIZE};

/// `/ws` carries one message per text or binary frame; `/healthz` answers
/// `ok`. Upgraded connections end when `shutdown` flips to true.
pub fn routes(
    inbound: mpsc::Sender<Inbound>,
    shutdown: watch::Receiver<bool>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_inbound = warp::any().map(move || inbound.clone());
    let with_shutdown = warp::any().map(move || shutdown.clone());

    let healthz = warp::path!("healthz").map(|| "ok");

    let ws = warp::path!("ws")
        .and(warp::ws())
        .and(with_inbound)
        .and(with_shutdown)
        .map(
            |ws: warp::ws::Ws, inbound: mpsc::Sender<Inbound>, shutdown: watch::Receiver<bool>| {
                ws.on_upgrade(move |socket| connection(socket, inbound, shutdown))
            },
        );

    healthz.or(ws).with(warp::log("tether_relay"))
}

async fn connection(
    ws: WebSocket,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer_id = PeerId::next_stream();
    log::debug!("websocket connection {}", peer_id);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);
    let peer = Peer::new(peer_id, Arc::new(ChannelPeer::new(out_tx)));

    let writer = tokio::task::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let msg = match out {
                Outbound::Frame(frame) => match String::from_utf8(frame) {
                    Ok(text) => Message::text(text),
                    Err(e) => Message::binary(e.into_bytes()),
                },
                Outbound::Close => {
                    let _ = ws_tx.send(Message::close()).await;
                    break;
                }
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            next = ws_rx.next() => next,
            _ = stopped(&mut shutdown) => {
                log::debug!("relay shutting down, dropping {}", peer_id);
                break;
            }
        };
        let msg = match next {
            Some(Ok(m)) => m,
            Some(Err(_)) | None => break,
        };
        if msg.is_close() {
            break;
        }
        if !(msg.is_text() || msg.is_binary()) {
            continue;
        }
        let item = Inbound::Frame {
            bytes: msg.into_bytes(),
            peer: peer.clone(),
        };
        if inbound.send(item).await.is_err() {
            break;
        }
    }

    let _ = inbound.send(Inbound::Closed(peer_id)).await;
    writer.abort();
    log::debug!("websocket connection {} closed", peer_id);
}
