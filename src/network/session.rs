//! Inbound session handling
//!
//! A session serves exactly one call: read one request, dispatch it to the
//! transport, write one response, close. Work rejections are answered with
//! WORK_FAILURE; anything else that goes wrong while serving a readable
//! request is answered with GENERIC_FAILURE.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use super::connection::{Connection, ConnectionError};
use crate::protocol::{Frame, Request, Response, ResponseKind, SubmitMode, Value};
use crate::transport::{NodeError, NodeResult, Transport};

/// Execute a decoded request against the local transport.
///
/// One arm per command family; the returned value becomes the OK_VALUE
/// payload, `None` becomes OK_VOID.
pub async fn dispatch(transport: &Transport, request: Request) -> NodeResult<Option<Value>> {
    match request {
        Request::Join { address } => {
            transport.local_join(&address).await?;
            Ok(None)
        }
        Request::Leave { address } => {
            transport.local_leave(&address);
            Ok(None)
        }
        Request::GetPeers => Ok(Some(Value::Peers(transport.peers()))),
        Request::Ping => {
            transport.local_ping();
            Ok(None)
        }
        Request::Submit { mode, id, work } => {
            let delay = transport.local_submit(mode, &id, work).await?;
            Ok(match (mode, delay) {
                (SubmitMode::Start, Some(delay)) => Some(Value::StartDelay(delay)),
                _ => None,
            })
        }
        Request::GetFree { pool, id } => Ok(Some(Value::Free(transport.local_free(&id, pool)))),
        Request::UpdateFree { pool, id, free } => {
            transport.local_update_free(&id, pool, free);
            Ok(None)
        }
        Request::GetStatistics { id } => {
            Ok(Some(Value::Statistics(transport.local_statistics(&id))))
        }
        Request::Delta { outcome, id } => {
            transport.local_delta(&id, outcome);
            Ok(None)
        }
    }
}

/// One inbound connection
pub struct Session<S> {
    conn: Connection<S>,
    transport: Transport,
    /// Bound on waiting for the request to arrive
    read_timeout: Option<Duration>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn: Connection<S>, transport: Transport) -> Self {
        Self {
            conn,
            transport,
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Serve the call and close the connection.
    ///
    /// Returns the kind of response written, or `None` when nothing could be
    /// sent (peer vanished before a full request arrived, or the write failed).
    pub async fn run(mut self) -> Option<ResponseKind> {
        let received = match self.read_timeout {
            Some(timeout) => self.conn.recv_timeout(timeout).await,
            None => self.conn.recv().await,
        };

        let response = match received {
            Ok(Some(frame)) => self.handle(frame).await,
            Ok(None) => {
                tracing::debug!(peer = %self.conn.peer(), "Connection closed before a request");
                self.close().await;
                return None;
            }
            Err(ConnectionError::Protocol(e)) => {
                tracing::warn!(peer = %self.conn.peer(), error = %e, "Malformed request");
                Response::GenericFailure(e.to_string())
            }
            Err(e) => {
                tracing::debug!(peer = %self.conn.peer(), error = %e, "Failed to read request");
                self.close().await;
                return None;
            }
        };

        let sent = match self.respond(&response).await {
            Ok(kind) => Some(kind),
            Err(e) => {
                tracing::debug!(peer = %self.conn.peer(), error = %e, "Error sending response");
                None
            }
        };

        self.close().await;
        sent
    }

    async fn handle(&self, frame: Frame) -> Response {
        let request = match Request::from_frame(&frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(
                    peer = %self.conn.peer(),
                    ordinal = frame.ordinal,
                    error = %e,
                    "Rejecting undecodable request"
                );
                return Response::GenericFailure(e.to_string());
            }
        };

        tracing::trace!(peer = %self.conn.peer(), "{}", request);

        // Dispatch on its own task so a panicking operation still gets an answer
        let transport = self.transport.clone();
        let outcome = tokio::spawn(async move { dispatch(&transport, request).await }).await;

        match outcome {
            Ok(Ok(None)) => Response::OkVoid,
            Ok(Ok(Some(value))) => Response::OkValue(value),
            Ok(Err(NodeError::Work(failure))) => {
                tracing::trace!(peer = %self.conn.peer(), failure = %failure, "Work failure");
                Response::WorkFailure(failure)
            }
            Ok(Err(e)) => {
                tracing::debug!(peer = %self.conn.peer(), error = %e, "Request failed");
                Response::GenericFailure(e.to_string())
            }
            Err(e) => {
                tracing::error!(peer = %self.conn.peer(), error = %e, "Dispatch task failed");
                Response::GenericFailure(format!("Dispatch failed: {}", e))
            }
        }
    }

    /// Write the response; a response that cannot be encoded degrades to
    /// GENERIC_FAILURE
    async fn respond(&mut self, response: &Response) -> Result<ResponseKind, ConnectionError> {
        let encoded = response.to_frame().map_err(ConnectionError::from);
        let result = match encoded {
            Ok(frame) => self.conn.send(&frame).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(response.kind()),
            Err(ConnectionError::Protocol(e)) => {
                tracing::warn!(peer = %self.conn.peer(), error = %e, "Response could not be encoded");
                let fallback = Response::GenericFailure(e.to_string());
                self.conn.send(&fallback.to_frame()?).await?;
                Ok(fallback.kind())
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.conn.shutdown().await {
            tracing::debug!(peer = %self.conn.peer(), error = %e, "Error closing connection");
        }
        tracing::trace!(
            peer = %self.conn.peer(),
            bytes_in = self.conn.stats().bytes_received,
            bytes_out = self.conn.stats().bytes_sent,
            "Session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{sample_request, Address, Command, Pool, WorkFailure, WorkItem};
    use crate::transport::tests::local_transport;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LIMIT: usize = 64 * 1024;

    fn encode(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        crate::protocol::Encoder::new().encode(frame, &mut buf).unwrap();
        buf.to_vec()
    }

    /// Run one session over an in-memory stream, feeding it raw request bytes
    async fn serve_raw(
        transport: Transport,
        request: &[u8],
    ) -> (Option<ResponseKind>, Option<Response>) {
        let (mut caller, server) = tokio::io::duplex(LIMIT);
        let session = Session::new(Connection::new(server, "caller", LIMIT), transport);
        let handle = tokio::spawn(session.run());

        caller.write_all(request).await.unwrap();
        caller.shutdown().await.unwrap();
        let mut reply = Vec::new();
        caller.read_to_end(&mut reply).await.unwrap();

        let sent = handle.await.unwrap();
        let mut buf = BytesMut::from(&reply[..]);
        let response = crate::protocol::Decoder::new()
            .decode(&mut buf)
            .unwrap()
            .map(|frame| Response::from_frame(&frame).unwrap());
        (sent, response)
    }

    async fn serve(transport: Transport, request: Request) -> Response {
        let (sent, response) = serve_raw(transport, &encode(&request.to_frame().unwrap())).await;
        let response = response.expect("session must answer");
        assert_eq!(sent, Some(response.kind()));
        response
    }

    #[tokio::test]
    async fn test_ping_with_mock_stream() {
        let (transport, _) = local_transport(1, 1);
        let request = encode(&Request::Ping.to_frame().unwrap());
        let response = encode(&Response::OkVoid.to_frame().unwrap());

        let stream = tokio_test::io::Builder::new()
            .read(&request)
            .write(&response)
            .build();

        let session = Session::new(Connection::new(stream, "mock", LIMIT), transport);
        assert_eq!(session.run().await, Some(ResponseKind::OkVoid));
    }

    #[tokio::test]
    async fn test_idle_caller_times_out() {
        let (transport, _) = local_transport(1, 1);
        let (_caller, server) = tokio::io::duplex(LIMIT);
        let session = Session::new(Connection::new(server, "idle", LIMIT), transport)
            .with_read_timeout(std::time::Duration::from_millis(20));
        assert_eq!(session.run().await, None);
    }

    #[tokio::test]
    async fn test_unknown_command_gets_generic_failure() {
        let (transport, _) = local_transport(1, 1);
        let (sent, response) = serve_raw(transport, &encode(&Frame::bare(77))).await;

        assert_eq!(sent, Some(ResponseKind::GenericFailure));
        match response {
            Some(Response::GenericFailure(message)) => assert!(message.contains("77")),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_gets_generic_failure() {
        let (transport, _) = local_transport(1, 1);
        let mut request = Vec::new();
        request.extend_from_slice(&Command::Ping.ordinal().to_be_bytes());
        request.extend_from_slice(&1u32.to_be_bytes());
        request.extend_from_slice(&(LIMIT as u32 * 2).to_be_bytes());

        let (sent, response) = serve_raw(transport, &request).await;
        assert_eq!(sent, Some(ResponseKind::GenericFailure));
        assert!(matches!(response, Some(Response::GenericFailure(_))));
    }

    #[tokio::test]
    async fn test_truncated_request_gets_no_response() {
        let (transport, _) = local_transport(1, 1);
        let (sent, response) = serve_raw(transport, &[0, 0, 0]).await;
        assert_eq!(sent, None);
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_rejected_work_is_work_failure() {
        let (transport, local) = local_transport(0, 0);
        let request = Request::Submit {
            mode: SubmitMode::Do,
            id: local,
            work: WorkItem::new("w", vec![]),
        };

        match serve(transport, request).await {
            Response::WorkFailure(WorkFailure::Rejected(_)) => {}
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_work_for_other_node_is_generic_failure() {
        let (transport, _) = local_transport(1, 1);
        let request = Request::Submit {
            mode: SubmitMode::Schedule,
            id: Address::new("elsewhere", "10.9.9.9:1"),
            work: WorkItem::new("w", vec![]),
        };

        assert!(matches!(
            serve(transport, request).await,
            Response::GenericFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_start_work_returns_delay() {
        let (transport, local) = local_transport(1, 1);
        let request = Request::Submit {
            mode: SubmitMode::Start,
            id: local,
            work: WorkItem::new("w", vec![]),
        };

        assert!(matches!(
            serve(transport, request).await,
            Response::OkValue(Value::StartDelay(_))
        ));
    }

    #[tokio::test]
    async fn test_update_then_get_free() {
        let (transport, _) = local_transport(1, 1);
        let id = Address::new("remote", "10.0.0.2:24900");

        let update = Request::UpdateFree { pool: Pool::ShortRunning, id: id.clone(), free: 9 };
        assert_eq!(serve(transport.clone(), update).await, Response::OkVoid);

        let get = Request::GetFree { pool: Pool::ShortRunning, id };
        assert_eq!(serve(transport, get).await, Response::OkValue(Value::Free(9)));
    }

    #[tokio::test]
    async fn test_every_request_gets_one_response() {
        let (transport, local) = local_transport(4, 4);

        for command in Command::ALL {
            let request = sample_request(command);
            let response = serve(transport.clone(), request.clone()).await;
            assert_eq!(
                response.kind(),
                expected_kind(command),
                "{} answered {:?}",
                request,
                response
            );
        }

        // Work addressed to this node reaches the engine
        for mode in [SubmitMode::Do, SubmitMode::Start, SubmitMode::Schedule] {
            let request = Request::Submit {
                mode,
                id: local.clone(),
                work: WorkItem::new("w", vec![]),
            };
            let response = serve(transport.clone(), request).await;
            assert!(!matches!(response, Response::GenericFailure(_)), "{:?}", response);
        }
    }

    /// Response kind for the sample request of each command on a lone node.
    /// Samples target a node that is not this one and is not listening.
    fn expected_kind(command: Command) -> ResponseKind {
        match command {
            Command::Join | Command::DoWork | Command::StartWork | Command::ScheduleWork => {
                ResponseKind::GenericFailure
            }
            Command::GetPeers
            | Command::GetShortRunningFree
            | Command::GetLongRunningFree
            | Command::GetStatistics => ResponseKind::OkValue,
            _ => ResponseKind::OkVoid,
        }
    }
}
