//! In-process fake shuffle server for client unit tests.

use std::time::Duration;

use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

use rss_domain::{AppMapId, WriteClientConfig};
use rss_protocol::{decode_control, read_frame, write_control, ClientMsg, Frame, FrameKind, ServerMsg};

use crate::connection::ServerConnection;

/// What the fake server observed on one connection.
#[derive(Debug, Default)]
pub struct ServerLog {
    pub starts: Vec<(AppMapId, i64)>,
    pub data_frames: Vec<Frame>,
    pub finish_acks_requested: Vec<bool>,
    pub commits: Vec<(AppMapId, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Normal,
    /// Complete the handshake, then never reply again.
    StallAfterHandshake,
}

pub fn test_config() -> WriteClientConfig {
    WriteClientConfig::new("fake", 0, "tester", "app-1", "0").with_timeout(Duration::from_secs(5))
}

pub async fn connected_pair(config: WriteClientConfig) -> (ServerConnection, JoinHandle<ServerLog>) {
    connected_pair_with(config, Behaviour::Normal).await
}

pub async fn connected_pair_with(
    config: WriteClientConfig,
    behaviour: Behaviour,
) -> (ServerConnection, JoinHandle<ServerLog>) {
    let (client_end, server_end) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(fake_server(server_end, behaviour));
    let conn = ServerConnection::establish(Box::new(client_end), &config)
        .await
        .expect("handshake with fake server");
    (conn, server)
}

async fn fake_server(mut stream: DuplexStream, behaviour: Behaviour) -> ServerLog {
    let mut log = ServerLog::default();
    let mut handshaken = false;

    while let Ok(Some(frame)) = read_frame(&mut stream).await {
        if frame.kind != FrameKind::Control {
            log.data_frames.push(frame);
            continue;
        }
        let msg: ClientMsg = match decode_control(&frame) {
            Ok(msg) => msg,
            Err(_) => break,
        };
        if handshaken && behaviour == Behaviour::StallAfterHandshake {
            continue;
        }
        let reply = match msg {
            ClientMsg::Connect { .. } => {
                handshaken = true;
                Some(ServerMsg::Connected {
                    server_id: "fake-1".into(),
                })
            }
            ClientMsg::StartUpload {
                app_map_id,
                attempt_id,
                ..
            } => {
                log.starts.push((app_map_id, attempt_id));
                Some(ServerMsg::UploadStarted)
            }
            ClientMsg::FinishUpload { ack } => {
                log.finish_acks_requested.push(ack);
                ack.then_some(ServerMsg::FinishUploadAck)
            }
            ClientMsg::Commit {
                app_map_id,
                attempt_id,
            } => {
                log.commits.push((app_map_id, attempt_id));
                Some(ServerMsg::Committed)
            }
            ClientMsg::Close => break,
        };
        if let Some(reply) = reply {
            if write_control(&mut stream, &reply).await.is_err() {
                break;
            }
        }
    }
    log
}
