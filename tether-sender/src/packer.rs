//! Outgoing request queue and container assembly.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use tether_mtproto::MtpState;
use tether_mtproto::control::MSG_CONTAINER_ID;

use crate::errors::InvocationError;
use crate::request::RequestState;

/// Most messages allowed in one `msg_container`.
const MAX_CONTAINER_MESSAGES: usize = 100;
/// Byte budget for one batch, covering bodies plus per-message headers.
const MAX_BATCH_SIZE: usize = 1_044_456;
/// `msg_id || seq_no || len` framing per message.
const MESSAGE_OVERHEAD: usize = 16;

/// One dequeued batch: the requests with their freshly assigned ids, and the
/// framed plaintext ready for session encryption.
pub struct Batch {
    pub states: Vec<RequestState>,
    pub data: Vec<u8>,
}

/// FIFO queue of outgoing requests with batched dequeue.
///
/// Ids are assigned at pack time, immediately before encryption, so requests
/// that sat in the queue across a reconnect never go out with a stale id.
pub struct MessagePacker {
    queue: Mutex<VecDeque<RequestState>>,
    notify: Notify,
}

impl MessagePacker {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, state: RequestState) {
        self.queue.lock().unwrap().push_back(state);
        self.notify.notify_one();
    }

    /// Re-inject previously pending requests at the front of the queue,
    /// preserving their relative order ahead of newly enqueued work.
    pub fn prepend(&self, states: Vec<RequestState>) {
        if states.is_empty() {
            return;
        }
        let mut queue = self.queue.lock().unwrap();
        for state in states.into_iter().rev() {
            queue.push_front(state);
        }
        drop(queue);
        self.notify.notify_one();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Nudge a sleeping `wait` without adding work.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Suspend until a request is queued or [`wake`](Self::wake) is called.
    ///
    /// May return with an empty queue after a bare wake; callers treat an
    /// empty batch as a cue to flush side work (acks) and wait again.
    pub async fn wait(&self) {
        if !self.is_empty() {
            return;
        }
        self.notify.notified().await;
    }

    /// Dequeue up to one container's worth of requests, assign their message
    /// ids from `mtp` and frame them for encryption.
    ///
    /// Aborted requests are resolved and skipped; a single request that can
    /// never fit a container is rejected with
    /// [`InvocationError::PayloadTooLarge`].
    pub fn pop_batch(&self, mtp: &mut MtpState) -> Option<Batch> {
        let mut selected: Vec<RequestState> = Vec::new();
        let mut size = 0usize;
        {
            let mut queue = self.queue.lock().unwrap();
            while selected.len() < MAX_CONTAINER_MESSAGES {
                let Some(front) = queue.front() else { break };
                let cost = front.body.len() + MESSAGE_OVERHEAD;
                if cost > MAX_BATCH_SIZE {
                    let mut state = queue.pop_front().unwrap();
                    state.resolve(Err(InvocationError::PayloadTooLarge));
                    continue;
                }
                if size + cost > MAX_BATCH_SIZE {
                    break;
                }
                let mut state = queue.pop_front().unwrap();
                if state.is_aborted() {
                    state.resolve(Err(InvocationError::Aborted));
                    continue;
                }
                size += cost;
                selected.push(state);
            }
        }
        if selected.is_empty() {
            return None;
        }

        let mut data = Vec::with_capacity(size + MESSAGE_OVERHEAD + 8);
        if selected.len() == 1 {
            let state = &mut selected[0];
            state.msg_id = mtp.write_data_as_message(&mut data, &state.body, state.content_related);
        } else {
            let mut inner = Vec::with_capacity(size);
            for state in &mut selected {
                state.msg_id =
                    mtp.write_data_as_message(&mut inner, &state.body, state.content_related);
            }
            let mut container = Vec::with_capacity(8 + inner.len());
            container.extend(MSG_CONTAINER_ID.to_le_bytes());
            container.extend((selected.len() as i32).to_le_bytes());
            container.extend_from_slice(&inner);

            let container_id = mtp.write_data_as_message(&mut data, &container, false);
            for state in &mut selected {
                state.container_id = Some(container_id);
            }
            tracing::debug!(
                count = selected.len(),
                container_id,
                "packed requests into container"
            );
        }

        Some(Batch {
            states: selected,
            data,
        })
    }
}

impl Default for MessagePacker {
    fn default() -> Self {
        Self::new()
    }
}
