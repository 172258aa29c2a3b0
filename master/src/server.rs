use std::{collections::HashMap, time::Instant};

use anyhow::{Context, Result};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use common::{ConnectionError, FrameReader, Message, StatusSnapshot, WorkerId};

use crate::config::SLOW_LOOP_DELAY;
use crate::coordinator::Coordinator;

/// Lo que las tareas lectoras le pasan al loop dueño del estado.
#[derive(Debug)]
enum Event {
    Message(WorkerId, Message),
    Closed(WorkerId, ConnectionError),
}

struct ConnHandle {
    write: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Una tarea por conexión: decodifica frames y los manda por el canal.
async fn read_loop(id: WorkerId, mut read: OwnedReadHalf, events: mpsc::UnboundedSender<Event>) {
    let mut frames = FrameReader::new();
    loop {
        match frames.next_message(&mut read).await {
            Ok(msg) => {
                if events.send(Event::Message(id, msg)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(Event::Closed(id, e));
                return;
            }
        }
    }
}

/// Loop principal del coordinador. Es el único que toca el estado de
/// scheduling; los sockets se leen en tareas aparte y se escriben acá
/// con `try_write` sin bloquear.
pub async fn run(
    listener: TcpListener,
    mut coordinator: Coordinator,
    status: Option<watch::Sender<StatusSnapshot>>,
) -> Result<()> {
    let tick_every = coordinator.config.tick;
    let slow = coordinator.config.slow;
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut conns: HashMap<WorkerId, ConnHandle> = HashMap::new();

    let mut ticker = interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "coordinador escuchando en {}",
        listener.local_addr().context("local_addr")?
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay({peer}): {e}");
                    }
                    let (read, write) = stream.into_split();
                    let id = coordinator.connect(peer.to_string(), Instant::now());
                    let reader = tokio::spawn(read_loop(id, read, tx.clone()));
                    conns.insert(id, ConnHandle { write, reader });
                }
                Err(e) => warn!("error aceptando conexión: {e}"),
            },

            Some(event) = rx.recv() => match event {
                Event::Message(id, msg) => {
                    coordinator
                        .handle_message(id, msg, Instant::now())
                        .context("scheduler invariant violated")?;
                }
                Event::Closed(id, e) => {
                    let reason = match e {
                        ConnectionError::PeerDisconnected => "desconectado".to_string(),
                        other => other.to_string(),
                    };
                    coordinator
                        .disconnect(id, &reason)
                        .context("scheduler invariant violated")?;
                }
            },

            _ = ticker.tick() => {
                let now = Instant::now();
                coordinator
                    .tick(now)
                    .context("scheduler invariant violated")?;
                if let Some(tx) = &status {
                    tx.send_replace(coordinator.snapshot(now));
                }
            }
        }

        // conexiones removidas: cerrar socket, sin aviso al otro lado
        for id in coordinator.take_evicted() {
            if let Some(conn) = conns.remove(&id) {
                conn.reader.abort();
                debug!(worker = id, "socket cerrado");
            }
        }

        // lo que no entra ahora queda en el buffer para la próxima vuelta
        let mut broken = Vec::new();
        for (id, conn) in &conns {
            let Some(writer) = coordinator.writer_mut(*id) else {
                continue;
            };
            if !writer.needs_flush() {
                continue;
            }
            if let Err(e) = writer.flush(&conn.write) {
                warn!(worker = *id, "error escribiendo: {e}");
                broken.push(*id);
            }
        }
        for id in broken {
            coordinator
                .disconnect(id, "error de escritura")
                .context("scheduler invariant violated")?;
            if let Some(conn) = conns.remove(&id) {
                conn.reader.abort();
            }
        }

        if slow {
            sleep(SLOW_LOOP_DELAY).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use common::{KernelRegistry, LocalStorage, MessageType};
    use std::{sync::Arc, time::Duration};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn subscribe_over_tcp_gets_an_ack_and_shows_in_status() {
        let dir = std::env::temp_dir().join("server_tests").join("subscribe");
        let _ = std::fs::remove_dir_all(&dir);
        let config = CoordinatorConfig {
            tick: Duration::from_millis(20),
            ..CoordinatorConfig::default()
        };
        let storage = LocalStorage::new(&dir).unwrap();
        let coordinator = Coordinator::new(config, Arc::new(storage), KernelRegistry::builtin());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (status_tx, mut status_rx) = watch::channel(StatusSnapshot::default());
        let server = tokio::spawn(run(listener, coordinator, Some(status_tx)));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut out = common::FrameWriter::new();
        out.send(&Message::subscribe());
        out.flush_all(&mut stream).await.unwrap();

        let mut frames = FrameReader::new();
        let reply = tokio::time::timeout(Duration::from_secs(5), frames.next_message(&mut stream))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is(MessageType::SubscribeAck));

        // el próximo tick publica al worker suscrito
        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                status_rx.changed().await.unwrap();
                let snap = status_rx.borrow_and_update().clone();
                if snap.workers.iter().any(|w| w.state == common::WorkerState::Idle) {
                    return snap;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.workers.len(), 1);

        server.abort();
    }
}
