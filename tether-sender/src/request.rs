//! In-flight request bookkeeping.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use tether_mtproto::control::HTTP_WAIT_ID;

use crate::errors::InvocationError;

/// The answer eventually delivered to a caller: raw result bytes on success.
pub type ResponseResult = Result<Vec<u8>, InvocationError>;

/// One outgoing request travelling through the packer, the wire and the
/// pending table.
///
/// `msg_id` and `container_id` stay zero/`None` until the packer assigns ids
/// at send time, so a request re-queued after a reconnect never carries a
/// stale id.
pub struct RequestState {
    /// TL-serialized request body.
    pub body: Vec<u8>,
    /// Message id assigned at pack time.
    pub msg_id: i64,
    /// Set when this request was bundled into a `msg_container`.
    pub container_id: Option<i64>,
    /// Odd seq-no and server ack expected when `true`.
    pub content_related: bool,
    tx: Option<oneshot::Sender<ResponseResult>>,
    abort: Option<CancellationToken>,
}

impl RequestState {
    /// A caller-visible request awaiting a response on `tx`.
    pub fn new(
        body: Vec<u8>,
        tx: oneshot::Sender<ResponseResult>,
        abort: Option<CancellationToken>,
    ) -> Self {
        Self {
            body,
            msg_id: 0,
            container_id: None,
            content_related: true,
            tx: Some(tx),
            abort,
        }
    }

    /// Fire-and-forget service chatter (acks, state info, keep-alives).
    pub fn detached(body: Vec<u8>, content_related: bool) -> Self {
        Self {
            body,
            msg_id: 0,
            container_id: None,
            content_related,
            tx: None,
            abort: None,
        }
    }

    /// The leading TL constructor id of the body, if present.
    pub fn constructor_id(&self) -> Option<u32> {
        self.body
            .get(..4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    /// Keep-alive requests are transmitted but never tracked for a response.
    pub fn is_keep_alive(&self) -> bool {
        self.constructor_id() == Some(HTTP_WAIT_ID)
    }

    /// Whether the receive loop should expect an answer for this request.
    pub fn wants_response(&self) -> bool {
        self.tx.is_some() && !self.is_keep_alive()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Deliver the final result to the caller. Safe to call once; later calls
    /// are no-ops, and a caller that stopped listening is ignored.
    pub fn resolve(&mut self, result: ResponseResult) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestState")
            .field("msg_id", &self.msg_id)
            .field("container_id", &self.container_id)
            .field("body_len", &self.body.len())
            .field("wants_response", &self.wants_response())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_mtproto::control::HttpWait;
    use tether_mtproto::tl::Serializable;

    #[test]
    fn keep_alive_detection() {
        let wait = RequestState::detached(HttpWait::default().to_bytes(), false);
        assert!(wait.is_keep_alive());
        assert!(!wait.wants_response());

        let (tx, _rx) = oneshot::channel();
        let req = RequestState::new(vec![1, 2, 3, 4], tx, None);
        assert!(!req.is_keep_alive());
        assert!(req.wants_response());
    }

    #[test]
    fn resolve_is_single_shot() {
        let (tx, mut rx) = oneshot::channel();
        let mut req = RequestState::new(vec![0; 4], tx, None);
        req.resolve(Ok(vec![9]));
        req.resolve(Err(InvocationError::Dropped));
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![9]);
    }

    #[test]
    fn abort_token_is_observed() {
        let token = CancellationToken::new();
        let (tx, _rx) = oneshot::channel();
        let req = RequestState::new(vec![0; 4], tx, Some(token.clone()));
        assert!(!req.is_aborted());
        token.cancel();
        assert!(req.is_aborted());
    }
}
