//! Test doubles for the host capability traits.

use core::cell::{Cell, RefCell};

use bt_hci::uuid::BluetoothUuid16;
use heapless::Vec;

use crate::channel::{AudioChannel, ChannelError, CodecId, Dir, QosParams};
use crate::host::{Address, Bonds, Connections, CryptoError, Notifier, SetCrypto};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Notification {
    pub peer: Option<Address>,
    pub characteristic: BluetoothUuid16,
    pub instance: u8,
    pub data: Vec<u8, 64>,
}

#[derive(Default)]
pub(crate) struct MockNotifier {
    pub sent: RefCell<Vec<Notification, 32>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, characteristic: BluetoothUuid16) -> usize {
        self.sent
            .borrow()
            .iter()
            .filter(|n| n.characteristic == characteristic)
            .count()
    }

    pub fn last(&self, characteristic: BluetoothUuid16) -> Option<Notification> {
        self.sent
            .borrow()
            .iter()
            .filter(|n| n.characteristic == characteristic)
            .last()
            .cloned()
    }

    pub fn clear(&self) {
        self.sent.borrow_mut().clear();
    }
}

impl Notifier for MockNotifier {
    fn notify(&self, peer: Option<&Address>, characteristic: BluetoothUuid16, instance: u8, data: &[u8]) {
        let notification = Notification {
            peer: peer.copied(),
            characteristic,
            instance,
            data: unwrap!(Vec::from_slice(data)),
        };
        unwrap!(self.sent.borrow_mut().push(notification).ok());
    }
}

#[derive(Default)]
pub(crate) struct MockBonds {
    pub bonded: RefCell<Vec<Address, 8>>,
}

impl MockBonds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Address) {
        unwrap!(self.bonded.borrow_mut().push(peer).ok());
    }
}

impl Bonds for MockBonds {
    fn is_bonded(&self, peer: &Address) -> bool {
        self.bonded.borrow().iter().any(|a| a == peer)
    }
}

#[derive(Default)]
pub(crate) struct MockConnections {
    pub connected: RefCell<Vec<Address, 8>>,
}

impl MockConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, peer: Address) {
        unwrap!(self.connected.borrow_mut().push(peer).ok());
    }

    pub fn disconnect(&self, peer: &Address) {
        self.connected.borrow_mut().retain(|a| a != peer);
    }
}

impl Connections for MockConnections {
    fn for_each_connected(&self, f: &mut dyn FnMut(&Address)) {
        for addr in self.connected.borrow().iter() {
            f(addr);
        }
    }
}

/// Deterministic stand-in for the controller crypto. `encrypt` is not
/// real AES, just a stable mixing of key and block the tests can predict.
#[derive(Default)]
pub(crate) struct MockCrypto {
    pub rand_queue: RefCell<Vec<u8, 32>>,
}

impl MockCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_rand(&self, bytes: &[u8]) {
        let mut queue = self.rand_queue.borrow_mut();
        for b in bytes {
            unwrap!(queue.push(*b).ok());
        }
    }
}

impl SetCrypto for MockCrypto {
    fn encrypt(&self, key: &[u8; 16], block: &[u8; 16]) -> Result<[u8; 16], CryptoError> {
        let mut out = [0; 16];
        for (i, o) in out.iter_mut().enumerate() {
            *o = key[i] ^ block[i] ^ (i as u8).wrapping_mul(0x1d);
        }
        Ok(out)
    }

    fn rand(&self, dest: &mut [u8]) -> Result<(), CryptoError> {
        let mut queue = self.rand_queue.borrow_mut();
        for d in dest.iter_mut() {
            *d = if queue.is_empty() { 0xa5 } else { queue.remove(0) };
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockChannel {
    pub next_error: Cell<Option<ChannelError>>,
    pub calls: RefCell<Vec<&'static str, 16>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: ChannelError) {
        self.next_error.set(Some(error));
    }

    fn record(&self, call: &'static str) -> Result<(), ChannelError> {
        unwrap!(self.calls.borrow_mut().push(call).ok());
        match self.next_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl AudioChannel for MockChannel {
    fn configure(&self, _peer: &Address, _ase: u8, _dir: Dir, _codec: &CodecId, _config: &[u8]) -> Result<(), ChannelError> {
        self.record("configure")
    }

    fn reconfigure(&self, _peer: &Address, _ase: u8, _codec: &CodecId, _config: &[u8]) -> Result<(), ChannelError> {
        self.record("reconfigure")
    }

    fn qos(&self, _peer: &Address, _ase: u8, _qos: &QosParams) -> Result<(), ChannelError> {
        self.record("qos")
    }

    fn enable(&self, _peer: &Address, _ase: u8, _metadata: &[u8]) -> Result<(), ChannelError> {
        self.record("enable")
    }

    fn metadata(&self, _peer: &Address, _ase: u8, _metadata: &[u8]) -> Result<(), ChannelError> {
        self.record("metadata")
    }

    fn start(&self, _peer: &Address, _ase: u8) -> Result<(), ChannelError> {
        self.record("start")
    }

    fn disable(&self, _peer: &Address, _ase: u8) -> Result<(), ChannelError> {
        self.record("disable")
    }

    fn stop(&self, _peer: &Address, _ase: u8) -> Result<(), ChannelError> {
        self.record("stop")
    }

    fn release(&self, _peer: &Address, _ase: u8, _cache: bool) -> Result<(), ChannelError> {
        self.record("release")
    }
}
