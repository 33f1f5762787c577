use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::wire::{self, Call};

/// A long-lived transport to one backend, owned by a [`Pool`](crate::pool::Pool)
/// and lent to one caller at a time.
///
/// There is no locking inside: [`Connection::exchange`] takes `&mut self`, so
/// holding the checked-out value is what makes the exchange exclusive.
pub struct Connection<S = TcpStream> {
    id: u64,
    stream: BufStream<S>,
    exchanges: u64,
    tainted: bool,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("exchanges", &self.exchanges)
            .field("tainted", &self.tainted)
            .finish()
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(id: u64, stream: S) -> Self {
        Self { id, stream: BufStream::new(stream), exchanges: 0, tainted: false }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of exchanges attempted on this connection.
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// A tainted connection saw an exchange fail and must not be reused.
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn taint(&mut self) {
        self.tainted = true;
    }

    /// Sends one request envelope, flushes it, then reads exactly one response.
    ///
    /// Never retries. Any failure taints the connection.
    #[tracing::instrument(skip(self, request), fields(conn = self.id, call = C::NAME))]
    pub async fn exchange<C: Call>(&mut self, request: &C) -> Result<C::Response> {
        self.exchanges += 1;
        let result = self.send_recv(request).await;
        if let Err(ref e) = result {
            tracing::debug!(error = %e, "exchange failed, tainting connection");
            self.tainted = true;
        }
        result
    }

    /// Like [`Connection::exchange`], giving up after `deadline`.
    ///
    /// An expired deadline leaves a half-read response on the stream, so the
    /// connection is tainted.
    pub async fn exchange_timeout<C: Call>(
        &mut self,
        request: &C,
        deadline: Duration,
    ) -> Result<C::Response> {
        match tokio::time::timeout(deadline, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(conn = self.id, call = C::NAME, ?deadline, "exchange timed out");
                self.tainted = true;
                Err(Error::Timeout(deadline))
            }
        }
    }

    async fn send_recv<C: Call>(&mut self, request: &C) -> Result<C::Response> {
        if self.tainted {
            return Err(Error::ConnectionClosed);
        }
        wire::write_frame(&mut self.stream, request).await?;
        match wire::read_frame(&mut self.stream).await? {
            Some(response) => Ok(response),
            None => Err(Error::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Headers, ListParentsRequest, ListParentsResponse};

    /// Answers each ListParents request with `[limit, limit + 1]`, sequentially.
    async fn echo_limits<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
        while let Some(request) =
            wire::read_frame::<_, ListParentsRequest>(&mut stream).await.unwrap()
        {
            let response = ListParentsResponse { ids: vec![request.limit, request.limit + 1] };
            wire::write_frame(&mut stream, &response).await.unwrap();
        }
    }

    #[tokio::test]
    async fn sequential_exchanges_stay_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(echo_limits(server));

        let mut conn = Connection::new(1, client);
        for limit in 0..20 {
            let response = conn
                .exchange(&ListParentsRequest { limit, headers: Headers::new() })
                .await
                .unwrap();
            assert_eq!(response.ids, vec![limit, limit + 1]);
        }
        assert_eq!(conn.exchanges(), 20);
        assert!(!conn.is_tainted());
    }

    #[tokio::test]
    async fn peer_hangup_taints_connection() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);

        let mut conn = Connection::new(7, client);
        let err =
            conn.exchange(&ListParentsRequest { limit: 1, headers: Headers::new() }).await;
        assert!(err.is_err());
        assert!(conn.is_tainted());

        let err = conn
            .exchange(&ListParentsRequest { limit: 1, headers: Headers::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(3, client);

        let err = conn
            .exchange_timeout(
                &ListParentsRequest { limit: 1, headers: Headers::new() },
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(conn.is_tainted());
    }
}
