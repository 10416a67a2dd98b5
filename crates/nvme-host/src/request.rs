//! Transfer descriptors and the per-queue-pair request pool.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::command::{Command, Completion};
use crate::{Error, Result};

/// Completion callback. Runs on the thread that polls the queue pair, after the
/// queue pair lock has been released.
pub type CompletionFn = Box<dyn FnOnce(&Completion) + Send>;

/// A physically contiguous piece of a scattered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub bus: u64,
    pub len: u32,
}

/// Iterator over the physical segments of a scattered payload.
pub trait ScatterGather: Send {
    /// Repositions the iterator at byte `offset` of the payload.
    fn reset(&mut self, offset: usize);

    /// Next physically contiguous segment, or `None` when the payload is exhausted.
    fn next_segment(&mut self) -> Option<Segment>;
}

pub type SharedSgl = Arc<Mutex<dyn ScatterGather>>;

/// Where a request's data lives.
#[derive(Clone)]
pub enum Payload {
    /// Virtually contiguous buffer starting at this CPU address.
    Contiguous(u64),
    Scattered(SharedSgl),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Contiguous(vaddr) => f.debug_tuple("Contiguous").field(vaddr).finish(),
            Payload::Scattered(_) => f.write_str("Scattered(..)"),
        }
    }
}

/// One logical transfer, optionally split into children.
///
/// A request with children is never submitted itself; each child occupies a
/// tracker, and the request's callback runs once the last child completes.
pub struct Request {
    pub(crate) cmd: Command,
    pub(crate) payload: Option<Payload>,
    pub(crate) payload_offset: usize,
    pub(crate) payload_size: usize,
    pub(crate) callback: Option<CompletionFn>,
    pub(crate) children: Vec<Request>,
}

impl Request {
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            payload: None,
            payload_offset: 0,
            payload_size: 0,
            callback: None,
            children: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Payload, size: usize) -> Self {
        self.payload = Some(payload);
        self.payload_size = size;
        self
    }

    /// Restricts the payload to `size` bytes starting `offset` bytes in.
    pub fn with_payload_range(mut self, payload: Payload, offset: usize, size: usize) -> Self {
        self.payload = Some(payload);
        self.payload_offset = offset;
        self.payload_size = size;
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(&Completion) + Send + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    pub(crate) fn add_child(&mut self, child: Request) {
        debug_assert!(child.children.is_empty());
        self.children.push(child);
    }

    pub fn command(&self) -> &Command {
        &self.cmd
    }

    pub fn children(&self) -> &[Request] {
        &self.children
    }

    /// Byte range of the payload covered by this request.
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        self.payload_offset..self.payload_offset + self.payload_size
    }

    /// Number of trackers this request occupies once submitted.
    pub fn leaf_count(&self) -> usize {
        self.children.len().max(1)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("cmd", &self.cmd)
            .field("payload", &self.payload)
            .field("payload_offset", &self.payload_offset)
            .field("payload_size", &self.payload_size)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RequestId(u32);

/// A request parked in the pool.
pub(crate) struct PooledRequest {
    pub cmd: Command,
    pub payload: Option<Payload>,
    pub payload_offset: usize,
    pub payload_size: usize,
    pub callback: Option<CompletionFn>,
    pub retries: u32,
    pub parent: Option<RequestId>,
    /// Children still outstanding.
    pub children: Vec<RequestId>,
    pub first_error: Option<Completion>,
}

impl PooledRequest {
    fn from_request(req: &mut Request, parent: Option<RequestId>) -> Self {
        Self {
            cmd: req.cmd,
            payload: req.payload.take(),
            payload_offset: req.payload_offset,
            payload_size: req.payload_size,
            callback: req.callback.take(),
            retries: 0,
            parent,
            children: Vec::new(),
            first_error: None,
        }
    }
}

/// Fixed-capacity request storage with an index free list.
pub(crate) struct RequestPool {
    slots: Vec<Option<PooledRequest>>,
    free: Vec<RequestId>,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        let free = (0..capacity as u32).rev().map(RequestId).collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    fn alloc(&mut self, req: PooledRequest) -> RequestId {
        let id = self.free.pop().expect("pool capacity checked by caller");
        self.slots[id.0 as usize] = Some(req);
        id
    }

    /// Stores `req` and its children. Returns the ids that need a tracker, in
    /// submission order. Nothing is stored if the pool cannot hold all of them.
    pub fn insert(&mut self, mut req: Request) -> Result<Vec<RequestId>> {
        let needed = if req.children.is_empty() {
            1
        } else {
            1 + req.children.len()
        };
        if self.free.len() < needed {
            return Err(Error::NoFreeRequest);
        }

        let mut children = std::mem::take(&mut req.children);
        let parent = self.alloc(PooledRequest::from_request(&mut req, None));
        if children.is_empty() {
            return Ok(vec![parent]);
        }

        let ids: Vec<RequestId> = children
            .iter_mut()
            .map(|child| self.alloc(PooledRequest::from_request(child, Some(parent))))
            .collect();
        self.get_mut(parent).children = ids.clone();
        Ok(ids)
    }

    pub fn get(&self, id: RequestId) -> &PooledRequest {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("request id refers to a live slot")
    }

    pub fn get_mut(&mut self, id: RequestId) -> &mut PooledRequest {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("request id refers to a live slot")
    }

    fn release(&mut self, id: RequestId) -> PooledRequest {
        let req = self.slots[id.0 as usize]
            .take()
            .expect("request id refers to a live slot");
        self.free.push(id);
        req
    }

    /// Retires a submitted request with its final completion. Returns the
    /// callback that should run, which belongs to the parent when `id` was the
    /// last outstanding child.
    pub fn complete(
        &mut self,
        id: RequestId,
        cpl: &Completion,
    ) -> Option<(CompletionFn, Completion)> {
        let req = self.release(id);
        let Some(parent_id) = req.parent else {
            return req.callback.map(|cb| (cb, *cpl));
        };

        let parent = self.get_mut(parent_id);
        parent.children.retain(|&c| c != id);
        if cpl.status.is_error() && parent.first_error.is_none() {
            parent.first_error = Some(*cpl);
        }
        if !parent.children.is_empty() {
            return None;
        }

        let parent = self.release(parent_id);
        let final_cpl = parent.first_error.unwrap_or(*cpl);
        parent.callback.map(|cb| (cb, final_cpl))
    }
}
