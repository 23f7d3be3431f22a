//! In-memory collaborators for unit tests.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    net::SocketAddr,
    rc::Rc,
};

use crate::{
    io::{InputPin, OutputPin, PwmOutput},
    net::{Connection, Connector, DatagramSocket},
    properties::{PropertyStore, StoreError},
};

#[derive(Debug, Default)]
struct StoreState {
    blob: Option<String>,
    saves: usize,
    failing: bool,
}

/// Property store kept in memory. Clones share the same blob.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<StoreState>>,
}

impl MemoryStore {
    pub fn new(blob: Option<&str>) -> Self {
        let store = Self::default();
        store.state.borrow_mut().blob = blob.map(str::to_string);
        store
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.state.borrow_mut().failing = true;
        store
    }

    pub fn saves(&self) -> usize {
        self.state.borrow().saves
    }

    pub fn blob(&self) -> Option<String> {
        self.state.borrow().blob.clone()
    }
}

impl PropertyStore for MemoryStore {
    fn load(&mut self) -> Result<Option<String>, StoreError> {
        Ok(self.state.borrow().blob.clone())
    }

    fn save(&mut self, blob: &str) -> Result<(), StoreError> {
        let mut state = self.state.borrow_mut();
        if state.failing {
            return Err(StoreError::Backend("flash unavailable".to_string()));
        }
        state.blob = Some(blob.to_string());
        state.saves += 1;
        Ok(())
    }
}

/// Records outgoing datagrams and replays queued incoming ones.
#[derive(Debug, Default)]
pub struct MockSocket {
    sent: Vec<(SocketAddr, String)>,
    incoming: VecDeque<(Vec<u8>, SocketAddr)>,
    failing: Vec<SocketAddr>,
}

impl MockSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> &[(SocketAddr, String)] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<(SocketAddr, String)> {
        std::mem::take(&mut self.sent)
    }

    pub fn fail_sends_to(&mut self, target: SocketAddr) {
        self.failing.push(target);
    }

    pub fn receive(&mut self, payload: &str, from: SocketAddr) {
        self.incoming.push_back((payload.as_bytes().to_vec(), from));
    }
}

impl DatagramSocket for MockSocket {
    fn send_to(&mut self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.failing.contains(&target) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unreachable"));
        }
        self.sent
            .push((target, String::from_utf8_lossy(payload).into_owned()));
        Ok(payload.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((payload, from)) = self.incoming.pop_front() else {
            return Ok(None);
        };
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok(Some((len, from)))
    }
}

#[derive(Debug)]
enum ReadStep {
    Data(Vec<u8>),
    Eof,
}

/// Scripted TCP connection. Without replies it stays silent forever.
#[derive(Debug)]
pub struct MockConnection {
    connects: bool,
    reads: VecDeque<ReadStep>,
    write_limit: Option<usize>,
    stalled: bool,
    sent: Rc<RefCell<Vec<u8>>>,
    closed: Rc<Cell<bool>>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            connects: true,
            reads: VecDeque::new(),
            write_limit: None,
            stalled: false,
            sent: Rc::default(),
            closed: Rc::default(),
        }
    }

    /// A connection attempt that never completes.
    pub fn pending() -> Self {
        Self {
            connects: false,
            ..Self::new()
        }
    }

    pub fn reply(mut self, bytes: &[u8]) -> Self {
        self.reads.push_back(ReadStep::Data(bytes.to_vec()));
        self
    }

    /// The peer closes once earlier replies are read.
    pub fn close(mut self) -> Self {
        self.reads.push_back(ReadStep::Eof);
        self
    }

    /// Accepts at most `limit` bytes per write, then blocks until the next write.
    pub fn write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    pub fn sent(&self) -> Rc<RefCell<Vec<u8>>> {
        self.sent.clone()
    }

    pub fn closed(&self) -> Rc<Cell<bool>> {
        self.closed.clone()
    }
}

impl Connection for MockConnection {
    fn poll_connect(&mut self) -> io::Result<bool> {
        Ok(self.connects)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(limit) = self.write_limit else {
            self.sent.borrow_mut().extend_from_slice(buf);
            return Ok(buf.len());
        };
        if self.stalled {
            self.stalled = false;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let len = limit.min(buf.len());
        self.sent.borrow_mut().extend_from_slice(&buf[..len]);
        self.stalled = true;
        Ok(len)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => {
                self.reads.push_front(ReadStep::Eof);
                Ok(0)
            }
            Some(ReadStep::Data(mut data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                if len < data.len() {
                    self.reads.push_front(ReadStep::Data(data.split_off(len)));
                }
                Ok(len)
            }
        }
    }

    fn close(&mut self) {
        self.closed.set(true);
    }
}

#[derive(Debug)]
enum Plan {
    Refuse,
    Connect(MockConnection),
}

/// Hands out scripted connections in order. Once the script runs out every attempt hangs
/// in the connecting phase, like an unreachable host.
#[derive(Debug, Default)]
pub struct MockConnector {
    plans: VecDeque<Plan>,
    attempts: Vec<(String, u16)>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, connection: MockConnection) -> Self {
        self.plans.push_back(Plan::Connect(connection));
        self
    }

    pub fn refuse(mut self) -> Self {
        self.plans.push_back(Plan::Refuse);
        self
    }

    pub fn push(&mut self, connection: MockConnection) {
        self.plans.push_back(Plan::Connect(connection));
    }

    pub fn attempts(&self) -> Vec<(String, u16)> {
        self.attempts.clone()
    }
}

impl Connector for MockConnector {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        _timeout_ms: u64,
    ) -> io::Result<Box<dyn Connection>> {
        self.attempts.push((host.to_string(), port));
        match self.plans.pop_front() {
            Some(Plan::Refuse) => Err(io::ErrorKind::ConnectionRefused.into()),
            Some(Plan::Connect(connection)) => Ok(Box::new(connection)),
            None => Ok(Box::new(MockConnection::pending())),
        }
    }
}

/// Input pin whose level the test sets. Clones share the level.
#[derive(Debug, Clone, Default)]
pub struct SharedInput(Rc<Cell<bool>>);

impl SharedInput {
    pub fn new(level: bool) -> Self {
        Self(Rc::new(Cell::new(level)))
    }

    pub fn set(&self, level: bool) {
        self.0.set(level);
    }
}

impl InputPin for SharedInput {
    fn is_high(&mut self) -> bool {
        self.0.get()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedOutput(Rc<Cell<bool>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.0.get()
    }
}

impl OutputPin for SharedOutput {
    fn set_level(&mut self, high: bool) {
        self.0.set(high);
    }

    fn is_set_high(&self) -> bool {
        self.0.get()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedPwm(Rc<Cell<u32>>);

impl SharedPwm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duty(&self) -> u32 {
        self.0.get()
    }
}

impl PwmOutput for SharedPwm {
    fn set_duty(&mut self, duty: u32) {
        self.0.set(duty);
    }
}
