//! Outbound calls
//!
//! Every call opens its own connection, writes one request, reads one
//! response and closes. Both the connect and the whole exchange are bounded
//! by timeouts; a timeout is a transport failure, never a work failure.

use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;

use super::connection::{Connection, ConnectionError};
use super::{resolve_endpoint, NetworkConfig};
use crate::protocol::{
    Address, CodecError, Command, Outcome, Pool, Request, Response, Statistics, SubmitMode, Value,
    WorkFailure, WorkItem,
};

/// Client errors
#[derive(Error, Debug)]
pub enum CallError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed without a response")]
    NoResponse,

    #[error(transparent)]
    Work(WorkFailure),

    #[error("Remote failure: {0}")]
    Remote(String),

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(Command),
}

impl CallError {
    /// The remote engine refused the work; the caller may route elsewhere
    pub fn is_work_failure(&self) -> bool {
        matches!(self, CallError::Work(_))
    }
}

pub type CallResult<T> = Result<T, CallError>;

/// Issues calls to other nodes
#[derive(Debug, Clone)]
pub struct Client {
    config: NetworkConfig,
}

impl Client {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    /// Perform one call and return the raw response
    pub async fn call(&self, endpoint: &str, request: &Request) -> CallResult<Response> {
        let frame = request.to_frame()?;
        let server_addr = resolve_endpoint(endpoint).await?;

        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(CallError::Io(e)),
            Err(_) => return Err(CallError::Timeout(self.config.connect_timeout())),
        };

        let mut conn = Connection::new(stream, endpoint, self.config.max_message_size);

        let exchange = async {
            conn.send(&frame).await?;
            conn.recv().await
        };

        let reply = match tokio::time::timeout(self.config.call_timeout(), exchange).await {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => return Err(CallError::NoResponse),
            Ok(Err(ConnectionError::Closed)) => return Err(CallError::NoResponse),
            Ok(Err(e)) => return Err(CallError::Connection(e)),
            Err(_) => return Err(CallError::Timeout(self.config.call_timeout())),
        };

        let _ = conn.shutdown().await;

        tracing::trace!(endpoint = %endpoint, request = %request, "Call completed");
        Ok(Response::from_frame(&reply)?)
    }

    /// Perform one call, turning failure responses into errors
    pub async fn request(&self, endpoint: &str, request: &Request) -> CallResult<Option<Value>> {
        match self.call(endpoint, request).await? {
            Response::OkVoid => Ok(None),
            Response::OkValue(value) => Ok(Some(value)),
            Response::WorkFailure(failure) => Err(CallError::Work(failure)),
            Response::GenericFailure(message) => Err(CallError::Remote(message)),
        }
    }

    async fn expect_void(&self, endpoint: &str, request: Request) -> CallResult<()> {
        match self.request(endpoint, &request).await? {
            None => Ok(()),
            Some(_) => Err(CallError::UnexpectedResponse(request.command())),
        }
    }

    async fn expect_value(&self, endpoint: &str, request: Request) -> CallResult<(Command, Value)> {
        match self.request(endpoint, &request).await? {
            Some(value) => Ok((request.command(), value)),
            None => Err(CallError::UnexpectedResponse(request.command())),
        }
    }

    /// Round-trip time of a PING
    pub async fn ping(&self, endpoint: &str) -> CallResult<Duration> {
        let start = Instant::now();
        self.expect_void(endpoint, Request::Ping).await?;
        Ok(start.elapsed())
    }

    pub async fn join(&self, endpoint: &str, address: &Address) -> CallResult<()> {
        self.expect_void(endpoint, Request::Join { address: address.clone() })
            .await
    }

    pub async fn peers(&self, endpoint: &str) -> CallResult<HashSet<Address>> {
        match self.expect_value(endpoint, Request::GetPeers).await? {
            (_, Value::Peers(peers)) => Ok(peers),
            (command, _) => Err(CallError::UnexpectedResponse(command)),
        }
    }

    /// Free slots of `id`, as known by the node at `endpoint`
    pub async fn free(&self, endpoint: &str, id: &Address, pool: Pool) -> CallResult<u64> {
        let request = Request::GetFree { pool, id: id.clone() };
        match self.expect_value(endpoint, request).await? {
            (_, Value::Free(free)) => Ok(free),
            (command, _) => Err(CallError::UnexpectedResponse(command)),
        }
    }

    pub async fn update_free(
        &self,
        endpoint: &str,
        id: &Address,
        pool: Pool,
        free: u64,
    ) -> CallResult<()> {
        let request = Request::UpdateFree { pool, id: id.clone(), free };
        self.expect_void(endpoint, request).await
    }

    pub async fn statistics(&self, endpoint: &str, id: &Address) -> CallResult<Statistics> {
        match self
            .expect_value(endpoint, Request::GetStatistics { id: id.clone() })
            .await?
        {
            (_, Value::Statistics(stats)) => Ok(stats),
            (command, _) => Err(CallError::UnexpectedResponse(command)),
        }
    }

    pub async fn delta(&self, endpoint: &str, id: &Address, outcome: Outcome) -> CallResult<()> {
        self.expect_void(endpoint, Request::Delta { outcome, id: id.clone() })
            .await
    }

    /// Submit work to the node hosting `id`.
    ///
    /// Returns the start delay in milliseconds for [`SubmitMode::Start`].
    pub async fn submit(
        &self,
        id: &Address,
        mode: SubmitMode,
        work: WorkItem,
    ) -> CallResult<Option<u64>> {
        let request = Request::Submit { mode, id: id.clone(), work };
        let command = request.command();

        match (mode, self.request(&id.endpoint, &request).await?) {
            (SubmitMode::Start, Some(Value::StartDelay(delay))) => Ok(Some(delay)),
            (SubmitMode::Do | SubmitMode::Schedule, None) => Ok(None),
            _ => Err(CallError::UnexpectedResponse(command)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn client() -> Client {
        Client::new(NetworkConfig {
            connect_timeout_ms: 500,
            call_timeout_ms: 100,
            ..NetworkConfig::loopback()
        })
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client().ping(&endpoint).await.unwrap_err();
        assert!(matches!(err, CallError::Io(_)));
        assert!(!err.is_work_failure());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        // Accept and hold the connection without answering
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(stream);
        });

        let err = client().ping(&endpoint).await.unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
        holder.abort();
    }

    #[tokio::test]
    async fn test_dropped_response_is_no_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        // Read the request, then close without answering
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, "caller", 1024);
            let _ = conn.recv().await;
        });

        let err = client().ping(&endpoint).await.unwrap_err();
        assert!(matches!(err, CallError::NoResponse));
    }
}
