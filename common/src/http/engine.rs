use std::fmt;

use log::{debug, warn};

use super::{
    client::{HttpClient, HttpResponse},
    error::{describe_result, HttpClientError},
    request::HttpRequest,
};
use crate::net::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(u32);

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a completion callback is told about its finished request.
#[derive(Debug)]
pub struct Completed<'a> {
    pub handle: ClientHandle,
    pub result: Result<u16, HttpClientError>,
    pub response: &'a HttpResponse,
}

/// Runs once when a request finishes. It may queue further requests on the engine,
/// which start on the following tick.
pub type CompletionCallback = Box<dyn FnOnce(&mut HttpClientEngine, Completed<'_>)>;

struct Slot {
    handle: ClientHandle,
    client: HttpClient,
    callback: Option<CompletionCallback>,
}

/// Owns every in-flight client and advances them all from the main loop.
#[derive(Default)]
pub struct HttpClientEngine {
    slots: Vec<Slot>,
    next_handle: u32,
}

impl HttpClientEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an idle client. It does nothing until [`HttpClient::begin`] is called on it.
    pub fn allocate<F>(&mut self, callback: F) -> ClientHandle
    where
        F: FnOnce(&mut HttpClientEngine, Completed<'_>) + 'static,
    {
        self.insert(Some(Box::new(callback)))
    }

    pub fn send<F>(&mut self, request: HttpRequest, callback: F) -> ClientHandle
    where
        F: FnOnce(&mut HttpClientEngine, Completed<'_>) + 'static,
    {
        let handle = self.allocate(callback);
        if let Some(client) = self.client_mut(handle) {
            client.begin(request);
        }
        handle
    }

    /// Fire and forget.
    pub fn send_detached(&mut self, request: HttpRequest) -> ClientHandle {
        let handle = self.insert(None);
        if let Some(client) = self.client_mut(handle) {
            client.begin(request);
        }
        handle
    }

    pub fn client_mut(&mut self, handle: ClientHandle) -> Option<&mut HttpClient> {
        self.slots
            .iter_mut()
            .find(|slot| slot.handle == handle)
            .map(|slot| &mut slot.client)
    }

    /// Drops a client without running its callback.
    pub fn free(&mut self, handle: ClientHandle) -> bool {
        let Some(index) = self.slots.iter().position(|slot| slot.handle == handle) else {
            return false;
        };
        let mut slot = self.slots.remove(index);
        slot.client.close();
        true
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Polls every client once, then runs the callbacks of the ones that finished in
    /// allocation order. Returns how many finished.
    pub fn tick(&mut self, now_ms: u64, connector: &mut dyn Connector) -> usize {
        if self.slots.is_empty() {
            return 0;
        }
        let slots = std::mem::take(&mut self.slots);
        let mut finished = Vec::new();
        for mut slot in slots {
            match slot.client.poll(now_ms, connector) {
                Some(result) => finished.push((slot, result)),
                None => self.slots.push(slot),
            }
        }

        let count = finished.len();
        for (mut slot, result) in finished {
            debug!("HTTP client {} done: {}", slot.handle, describe_result(result));
            if let Some(callback) = slot.callback.take() {
                callback(
                    self,
                    Completed {
                        handle: slot.handle,
                        result,
                        response: slot.client.response(),
                    },
                );
            } else if let Err(err) = result {
                warn!("HTTP client {} failed: {} {err}", slot.handle, err.code());
            }
        }
        count
    }

    fn insert(&mut self, callback: Option<CompletionCallback>) -> ClientHandle {
        let handle = ClientHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.slots.push(Slot {
            handle,
            client: HttpClient::new(),
            callback,
        });
        handle
    }
}
