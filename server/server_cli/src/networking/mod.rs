use futures::{SinkExt, StreamExt};
use log::{error, info, warn};
use server_shared::commands::{Command, CommandParseError, Reply};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::dispatcher::Dispatcher;

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_message_length: usize,
    /// failures in a row answered with `nak`, one more closes the connection
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Closed,
    TooManyFailures,
    PeerDisconnected,
}

/// Accepts a single client and serves it until the session ends.
pub async fn serve(listener: TcpListener, mut dispatcher: Dispatcher, limits: SessionLimits) -> anyhow::Result<SessionEnd> {
    info!("Awaiting connection. address: {}", listener.local_addr()?);
    let (stream, peer) = listener.accept().await?;
    info!("Connection accepted. peer: {}", peer);

    let end = serve_connection(stream, &mut dispatcher, limits).await?;
    info!("Session ended. peer: {}, reason: {:?}", peer, end);
    Ok(end)
}

/// Reads newline-delimited commands and answers each one with exactly one line.
///
/// Requests are handled strictly one after the other, blocking handlers run in place on the
/// current worker thread.
pub async fn serve_connection<S>(stream: S, dispatcher: &mut Dispatcher, limits: SessionLimits) -> anyhow::Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(limits.max_message_length));
    let mut failures = 0_u32;
    let mut resume_after_error = false;

    loop {
        let frame = match framed.next().await {
            Some(frame) => frame,
            // a codec error is followed by a single `None` before the stream resumes
            None if resume_after_error => {
                resume_after_error = false;
                continue;
            }
            None => break,
        };
        resume_after_error = frame.is_err();

        let (command, result) = match frame {
            Ok(line) => {
                info!("Received: {:?}", line);
                handle_line(dispatcher, &line)
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => (
                None,
                Err(anyhow::anyhow!(
                    "message exceeds max length. max: {}",
                    limits.max_message_length
                )),
            ),
            Err(LinesCodecError::Io(e)) => (None, Err(e.into())),
        };

        let reply = match result {
            Ok(reply) => {
                failures = 0;
                reply
            }
            Err(e) => {
                failures += 1;
                error!("Command failed. failures: {}, error: {:#}", failures, e);
                if failures > limits.max_consecutive_failures {
                    warn!("Too many consecutive failures, closing connection. failures: {}", failures);
                    return Ok(SessionEnd::TooManyFailures);
                }
                Reply::Nak
            }
        };

        framed.send(reply.to_string()).await?;
        info!("Sent response: {}", reply);

        if matches!(command, Some(Command::Close)) && reply == Reply::Ack {
            return Ok(SessionEnd::Closed);
        }
    }

    Ok(SessionEnd::PeerDisconnected)
}

fn handle_line(dispatcher: &mut Dispatcher, line: &str) -> (Option<Command>, anyhow::Result<Reply>) {
    match line.parse::<Command>() {
        Ok(command) => {
            let result = tokio::task::block_in_place(|| dispatcher.handle(&command));
            (Some(command), result)
        }
        Err(CommandParseError::Unknown(identifier)) => {
            warn!("Unknown command. identifier: {:?}", identifier);
            (None, Ok(Reply::UnknownCommand))
        }
        Err(e) => (None, Err(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use server_common::camera::{SensorGeometry, SimulatedCameraConfig};
    use server_common::state::ServerState;
    use server_vision::convergence::ConvergenceSettings;
    use server_vision::simulated_capture::SimulatedCamera;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::config::PathsConfig;

    const LIMITS: SessionLimits = SessionLimits {
        max_message_length: 64,
        max_consecutive_failures: 3,
    };

    fn dispatcher(images: &Path) -> Dispatcher {
        let geometry = SensorGeometry {
            width: 64,
            height: 32,
            stride: 96,
        };
        let camera = SimulatedCamera::with_geometry(&SimulatedCameraConfig::default(), geometry).unwrap();
        let paths = PathsConfig {
            images: images.to_path_buf(),
            ..PathsConfig::default()
        };
        Dispatcher::new(Box::new(camera), ServerState::default(), paths, ConvergenceSettings::default())
    }

    async fn start(images: &Path) -> (JoinHandle<anyhow::Result<SessionEnd>>, Framed<TcpStream, LinesCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, dispatcher(images), LIMITS));

        let stream = TcpStream::connect(address).await.unwrap();
        (server, Framed::new(stream, LinesCodec::new()))
    }

    async fn request(client: &mut Framed<TcpStream, LinesCodec>, message: &str) -> Option<String> {
        client.send(message).await.unwrap();
        client.next().await.map(|line| line.unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queries_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut client) = start(dir.path()).await;

        assert_eq!(request(&mut client, "IDN?").await.as_deref(), Some("PiCam2-Simulated"));
        assert_eq!(request(&mut client, "  SRV:ECHO a   b ").await.as_deref(), Some("a b"));
        assert_eq!(request(&mut client, "SRV:NOPE").await.as_deref(), Some("unknown command"));
        assert_eq!(request(&mut client, "").await.as_deref(), Some("unknown command"));
        assert_eq!(request(&mut client, "SRV:CLOSE").await.as_deref(), Some("ack"));

        assert!(client.next().await.is_none());
        assert_eq!(server.await.unwrap().unwrap(), SessionEnd::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fourth_consecutive_failure_closes_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut client) = start(dir.path()).await;

        for _ in 0..3 {
            assert_eq!(request(&mut client, "CAM:CONF:SS fast").await.as_deref(), Some("nak"));
        }
        assert_eq!(request(&mut client, "CAM:CONF:SS fast").await, None);
        assert_eq!(server.await.unwrap().unwrap(), SessionEnd::TooManyFailures);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn success_resets_the_failure_count() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut client) = start(dir.path()).await;

        for _ in 0..3 {
            assert_eq!(request(&mut client, "CAM:CONF:FR 0").await.as_deref(), Some("nak"));
        }
        assert_eq!(request(&mut client, "CAM:CONF:SS 1000").await.as_deref(), Some("ack"));
        for _ in 0..3 {
            assert_eq!(request(&mut client, "CAP:SEQFET").await.as_deref(), Some("nak"));
        }
        assert_eq!(request(&mut client, "SRV:CLOSE").await.as_deref(), Some("ack"));
        assert_eq!(server.await.unwrap().unwrap(), SessionEnd::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_message_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut client) = start(dir.path()).await;

        let message = format!("SRV:ECHO {}", "x".repeat(100));
        assert_eq!(request(&mut client, &message).await.as_deref(), Some("nak"));
        assert_eq!(request(&mut client, "IDN?").await.as_deref(), Some("PiCam2-Simulated"));

        drop(client);
        assert_eq!(server.await.unwrap().unwrap(), SessionEnd::PeerDisconnected);
    }
}
