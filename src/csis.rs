//! Coordinated Set Identification Service (server role).
//!
//! Makes a device discoverable as a member of a coordinated set (via
//! SIRK and PSRI) and arbitrates exclusive access to the whole set
//! through the Set Member Lock characteristic. A held lock auto-releases
//! after a timeout, and peers that were offline or unencrypted when a
//! lock change was broadcast get the value delivered once their link is
//! secure again, tracked in a bounded per-peer ledger.

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};

use crate::host::{Address, Bonds, Connections, CryptoError, Notifier, SetCrypto};
use crate::types::uuid;
use crate::types::AttErrorCode;
use crate::Error;

/// Lock is held by another client.
pub const ERR_LOCK_DENIED: AttErrorCode = AttErrorCode::application(0x80);
/// Release attempted by a client that does not hold the lock.
pub const ERR_LOCK_RELEASE_DENIED: AttErrorCode = AttErrorCode::application(0x81);
/// Value written was neither the lock nor the release value.
pub const ERR_LOCK_INVALID_VALUE: AttErrorCode = AttErrorCode::application(0x82);

/// Set Member Lock released value.
pub const RELEASE_VALUE: u8 = 0x01;
/// Set Member Lock locked value.
pub const LOCK_VALUE: u8 = 0x02;

/// Size of the Set Identity Resolving Key.
pub const SIRK_SIZE: usize = 16;
/// Size of the Private Set Resolvable Identifier.
pub const PSRI_SIZE: usize = 6;

const PRAND_SIZE: usize = 3;
// Two of 2^22 draws are degenerate, so a handful of attempts makes a
// failure here a crypto fault rather than bad luck.
const PRAND_MAX_ATTEMPTS: usize = 8;

/// Configuration of a set member.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct SetMemberConfig {
    /// Number of devices in the set.
    pub set_size: u8,
    /// Rank of this member within the set.
    pub rank: u8,
    /// Seed for SIRK generation. The same seed and key yield the same
    /// SIRK on every member of the set.
    pub sirk_seed: u32,
    /// Key used to derive the SIRK from the seed. Must be shared by all
    /// members of the set.
    pub set_key: [u8; SIRK_SIZE],
    /// When the pending-notification ledger is full, overwrite the
    /// oldest bond instead of dropping the new one.
    pub evict_oldest: bool,
    /// How long a lock may be held before it auto-releases.
    pub lock_timeout: Duration,
}

impl Default for SetMemberConfig {
    fn default() -> Self {
        Self {
            set_size: 2,
            rank: 1,
            sirk_seed: 0,
            set_key: [0; SIRK_SIZE],
            evict_oldest: true,
            lock_timeout: Duration::from_secs(60),
        }
    }
}

/// Application observer for lock changes.
pub trait SetMemberHandler {
    /// The lock changed. `peer` is the client that wrote it, or `None`
    /// when the server changed it locally or by timeout.
    fn locked(&self, peer: Option<&Address>, locked: bool) {
        let _ = (peer, locked);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingEntry {
    addr: Option<Address>,
    pending: bool,
    age: u32,
}

struct SetInner<const PEERS: usize> {
    sirk: [u8; SIRK_SIZE],
    psri: [u8; PSRI_SIZE],
    set_size: u8,
    rank: u8,
    lock: u8,
    holder: Option<Address>,
    pending: [PendingEntry; PEERS],
    age_counter: u32,
}

enum TimerCommand {
    Arm,
    Cancel,
}

/// Coordinated Set Identification Service instance, tracking up to
/// `PEERS` bonded peers in the pending-notification ledger.
pub struct CoordinatedSetMember<'d, M: RawMutex, T: Notifier, B: Bonds, C: Connections, K: SetCrypto, const PEERS: usize>
{
    state: Mutex<M, RefCell<SetInner<PEERS>>>,
    timer: Signal<M, TimerCommand>,
    lock_timeout: Duration,
    evict_oldest: bool,
    notifier: &'d T,
    bonds: &'d B,
    connections: &'d C,
    crypto: &'d K,
    handler: Option<&'d dyn SetMemberHandler>,
}

impl<'d, M: RawMutex, T: Notifier, B: Bonds, C: Connections, K: SetCrypto, const PEERS: usize>
    CoordinatedSetMember<'d, M, T, B, C, K, PEERS>
{
    /// Create the service, deriving the SIRK from the configured seed.
    pub fn new(
        notifier: &'d T,
        bonds: &'d B,
        connections: &'d C,
        crypto: &'d K,
        config: SetMemberConfig,
        handler: Option<&'d dyn SetMemberHandler>,
    ) -> Result<Self, Error> {
        // r' = padding || seed
        let mut block = [0; 16];
        block[..4].copy_from_slice(&config.sirk_seed.to_le_bytes());
        let sirk = crypto.encrypt(&config.set_key, &block)?;

        Ok(Self {
            state: Mutex::new(RefCell::new(SetInner {
                sirk,
                psri: [0; PSRI_SIZE],
                set_size: config.set_size,
                rank: config.rank,
                lock: RELEASE_VALUE,
                holder: None,
                pending: [PendingEntry::default(); PEERS],
                age_counter: 0,
            })),
            timer: Signal::new(),
            lock_timeout: config.lock_timeout,
            evict_oldest: config.evict_oldest,
            notifier,
            bonds,
            connections,
            crypto,
            handler,
        })
    }

    /// Drive the lock timeout. Arms when a peer takes the lock, restarts
    /// when the lock is taken again and cancels on release; on expiry
    /// the lock is force-released and every subscriber notified.
    pub async fn run(&self) -> ! {
        loop {
            let mut armed = matches!(self.timer.wait().await, TimerCommand::Arm);
            while armed {
                match select(self.timer.wait(), Timer::after(self.lock_timeout)).await {
                    Either::First(TimerCommand::Arm) => {}
                    Either::First(TimerCommand::Cancel) => armed = false,
                    Either::Second(()) => {
                        self.on_lock_timeout();
                        armed = false;
                    }
                }
            }
        }
    }

    /// Wire value of the Set Identity Resolving Key characteristic.
    pub fn read_sirk(&self) -> [u8; SIRK_SIZE] {
        self.state.lock(|state| state.borrow().sirk)
    }

    /// Wire value of the Coordinated Set Size characteristic.
    pub fn read_set_size(&self) -> [u8; 1] {
        self.state.lock(|state| [state.borrow().set_size])
    }

    /// Wire value of the Set Member Lock characteristic.
    pub fn read_set_lock(&self) -> [u8; 1] {
        self.state.lock(|state| [state.borrow().lock])
    }

    /// Wire value of the Set Member Rank characteristic.
    pub fn read_rank(&self) -> [u8; 1] {
        self.state.lock(|state| [state.borrow().rank])
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.state.lock(|state| state.borrow().lock == LOCK_VALUE)
    }

    /// Handle a peer write to the Set Member Lock characteristic.
    ///
    /// `peer` is `None` for a server-local write.
    pub fn write_set_lock(&self, peer: Option<&Address>, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        if offset != 0 {
            return Err(AttErrorCode::INVALID_OFFSET);
        }
        if data.len() != 1 {
            return Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH);
        }

        let value = data[0];
        if value != RELEASE_VALUE && value != LOCK_VALUE {
            return Err(ERR_LOCK_INVALID_VALUE);
        }

        let changed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.lock == LOCK_VALUE {
                if value == LOCK_VALUE {
                    return Err(ERR_LOCK_DENIED);
                }
                if state.holder.as_ref() != peer {
                    return Err(ERR_LOCK_RELEASE_DENIED);
                }
            }

            let changed = state.lock != value;
            state.lock = value;
            if value == LOCK_VALUE {
                state.holder = peer.copied();
            } else {
                state.holder = None;
            }
            Ok(changed)
        })?;

        if value == LOCK_VALUE {
            self.timer.signal(TimerCommand::Arm);
        } else {
            self.timer.signal(TimerCommand::Cancel);
        }

        debug!("[csis] lock {}", value);

        if changed {
            // All clients except the writer are notified, if subscribed.
            self.broadcast(peer);
            if let Some(handler) = self.handler {
                handler.locked(peer, value == LOCK_VALUE);
            }
        }
        Ok(())
    }

    /// Lock or release the set locally.
    ///
    /// `force` only has meaning for a release and drops the lock no
    /// matter which client holds it.
    pub fn lock(&self, lock: bool, force: bool) -> Result<(), Error> {
        if !lock && force {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                state.lock = RELEASE_VALUE;
                state.holder = None;
            });
            self.timer.signal(TimerCommand::Cancel);
            self.broadcast(None);
            if let Some(handler) = self.handler {
                handler.locked(None, false);
            }
            Ok(())
        } else {
            let value = if lock { LOCK_VALUE } else { RELEASE_VALUE };
            self.write_set_lock(None, 0, &[value]).map_err(Error::Gatt)
        }
    }

    /// Handle a disconnect of `peer`.
    ///
    /// A lock held by a non-bonded device is force-released, and the
    /// device's ledger entry is dropped.
    pub fn on_disconnected(&self, peer: &Address) {
        if self.bonds.is_bonded(peer) {
            return;
        }
        debug!("[csis] non-bonded device disconnected");

        let release = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let release = state.lock == LOCK_VALUE && state.holder == Some(*peer);
            if release {
                state.lock = RELEASE_VALUE;
                state.holder = None;
            }
            for entry in state.pending.iter_mut() {
                if entry.addr == Some(*peer) {
                    *entry = PendingEntry::default();
                    break;
                }
            }
            release
        });

        if release {
            self.timer.signal(TimerCommand::Cancel);
            self.broadcast(None);
            if let Some(handler) = self.handler {
                handler.locked(Some(peer), false);
            }
        }
    }

    /// Handle a security level change of `peer`.
    ///
    /// Delivers a lock value the peer missed while its link was not yet
    /// encrypted.
    pub fn on_security_changed(&self, peer: &Address) {
        if !self.bonds.is_bonded(peer) {
            return;
        }

        let deliver = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let state = &mut *state;
            for entry in state.pending.iter_mut() {
                if entry.pending && entry.addr == Some(*peer) {
                    entry.pending = false;
                    return Some(state.lock);
                }
            }
            None
        });

        if let Some(lock) = deliver {
            self.notifier.notify(Some(peer), uuid::SET_LOCK, 0, &[lock]);
        }
    }

    /// Handle a completed pairing of `peer`.
    ///
    /// Bonded peers are recorded in the ledger so lock changes reach
    /// them across reconnects. A full ledger evicts the entry with the
    /// oldest bond when eviction is enabled, otherwise the new peer is
    /// dropped.
    pub fn on_pairing_complete(&self, peer: &Address, bonded: bool) {
        if !bonded {
            return;
        }

        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let age = state.age_counter;
            state.age_counter = state.age_counter.wrapping_add(1);

            for entry in state.pending.iter_mut() {
                if entry.addr == Some(*peer) {
                    entry.age = age;
                    return;
                }
            }

            for entry in state.pending.iter_mut() {
                if entry.addr.is_none() {
                    *entry = PendingEntry {
                        addr: Some(*peer),
                        pending: false,
                        age,
                    };
                    return;
                }
            }

            if self.evict_oldest {
                let mut oldest = 0;
                for index in 1..PEERS {
                    if state.pending[index].age < state.pending[oldest].age {
                        oldest = index;
                    }
                }
                state.pending[oldest] = PendingEntry {
                    addr: Some(*peer),
                    pending: false,
                    age,
                };
            } else {
                warn!("[csis] could not add device to pending notification list");
            }
        })
    }

    /// Generate a fresh PSRI from a new prand and the SIRK.
    pub fn update_psri(&self) -> Result<[u8; PSRI_SIZE], Error> {
        let prand = self.generate_prand()?;
        let sirk = self.state.lock(|state| state.borrow().sirk);
        let hash = sih(self.crypto, &sirk, prand)?;

        let mut psri = [0; PSRI_SIZE];
        psri[..3].copy_from_slice(&hash.to_le_bytes()[..3]);
        psri[3..].copy_from_slice(&prand.to_le_bytes()[..3]);
        self.state.lock(|state| state.borrow_mut().psri = psri);
        Ok(psri)
    }

    /// The most recently generated PSRI.
    pub fn psri(&self) -> [u8; PSRI_SIZE] {
        self.state.lock(|state| state.borrow().psri)
    }

    fn generate_prand(&self) -> Result<u32, Error> {
        for _ in 0..PRAND_MAX_ATTEMPTS {
            let mut bytes = [0; PRAND_SIZE];
            self.crypto.rand(&mut bytes)?;
            let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);

            // Prand must contain both a 1 and a 0 in its random part.
            if value != 0 && value != 0x3fffff {
                // Bit 23 shall be 0, bit 22 shall be 1.
                return Ok((value & 0x3fffff) | (1 << 22));
            }
        }
        warn!("[csis] could not generate a valid prand");
        Err(Error::Crypto(CryptoError::Failed))
    }

    fn on_lock_timeout(&self) {
        debug!("[csis] lock timeout, releasing");
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.lock = RELEASE_VALUE;
            state.holder = None;
        });
        self.broadcast(None);
        if let Some(handler) = self.handler {
            handler.locked(None, false);
        }
    }

    /// Notify the current lock value to everyone except `excluded`.
    ///
    /// Bonded peers that do not receive the value now are marked pending
    /// and served from the ledger once their link secures.
    fn broadcast(&self, excluded: Option<&Address>) {
        let lock = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            for entry in state.pending.iter_mut() {
                if let Some(addr) = entry.addr {
                    if Some(&addr) != excluded {
                        entry.pending = true;
                    }
                }
            }
            state.lock
        });

        self.connections.for_each_connected(&mut |addr| {
            if excluded == Some(addr) {
                return;
            }
            self.notifier.notify(Some(addr), uuid::SET_LOCK, 0, &[lock]);
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                for entry in state.pending.iter_mut() {
                    if entry.pending && entry.addr == Some(*addr) {
                        entry.pending = false;
                        break;
                    }
                }
            });
        });
    }

    #[cfg(test)]
    fn ledger(&self) -> heapless::Vec<(Address, bool, u32), PEERS> {
        self.state.lock(|state| {
            state
                .borrow()
                .pending
                .iter()
                .filter_map(|entry| entry.addr.map(|addr| (addr, entry.pending, entry.age)))
                .collect()
        })
    }
}

/// The set identity hash function `sih`.
///
/// `sih(k, r) = e(k, r') mod 2^24` with `r' = padding || r`.
pub fn sih<K: SetCrypto>(crypto: &K, sirk: &[u8; SIRK_SIZE], prand: u32) -> Result<u32, Error> {
    let mut block = [0; 16];
    block[..3].copy_from_slice(&prand.to_le_bytes()[..3]);

    let out = crypto.encrypt(sirk, &block)?;
    Ok(u32::from_le_bytes([out[0], out[1], out[2], 0]))
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::mock::{MockBonds, MockConnections, MockCrypto, MockNotifier};

    const PEER_A: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    const PEER_B: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
    const PEER_C: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

    type Member<'d> = CoordinatedSetMember<'d, NoopRawMutex, MockNotifier, MockBonds, MockConnections, MockCrypto, 2>;

    struct Fixture {
        notifier: MockNotifier,
        bonds: MockBonds,
        connections: MockConnections,
        crypto: MockCrypto,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                notifier: MockNotifier::new(),
                bonds: MockBonds::new(),
                connections: MockConnections::new(),
                crypto: MockCrypto::new(),
            }
        }

        fn member<'a>(&'a self, handler: Option<&'a dyn SetMemberHandler>) -> Member<'a> {
            unwrap!(CoordinatedSetMember::new(
                &self.notifier,
                &self.bonds,
                &self.connections,
                &self.crypto,
                SetMemberConfig {
                    set_size: 2,
                    rank: 1,
                    sirk_seed: 0x12345678,
                    set_key: [0x42; SIRK_SIZE],
                    ..SetMemberConfig::default()
                },
                handler,
            )
            .ok())
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        events: RefCell<heapless::Vec<(Option<Address>, bool), 8>>,
    }

    impl SetMemberHandler for CountingHandler {
        fn locked(&self, peer: Option<&Address>, locked: bool) {
            unwrap!(self.events.borrow_mut().push((peer.copied(), locked)).ok());
        }
    }

    #[test]
    fn lock_contention_and_timeout() {
        let f = Fixture::new();
        let handler = CountingHandler::default();
        let member = f.member(Some(&handler));
        let peer_a = Address::random(PEER_A);
        let peer_b = Address::random(PEER_B);
        f.connections.connect(peer_a);
        f.connections.connect(peer_b);

        // A takes the lock; only B is notified.
        unwrap!(member.write_set_lock(Some(&peer_a), 0, &[LOCK_VALUE]).ok());
        assert!(member.is_locked());
        assert_eq!(f.notifier.count(uuid::SET_LOCK), 1);
        assert_eq!(unwrap!(f.notifier.last(uuid::SET_LOCK)).peer, Some(peer_b));
        assert_eq!(handler.events.borrow()[..], [(Some(peer_a), true)]);

        // B cannot release a lock it does not hold, nor take it.
        assert_eq!(
            member.write_set_lock(Some(&peer_b), 0, &[RELEASE_VALUE]),
            Err(ERR_LOCK_RELEASE_DENIED)
        );
        assert_eq!(member.write_set_lock(Some(&peer_b), 0, &[LOCK_VALUE]), Err(ERR_LOCK_DENIED));
        assert!(member.is_locked());

        // Timeout force-releases and notifies everyone.
        f.notifier.clear();
        member.on_lock_timeout();
        assert!(!member.is_locked());
        assert_eq!(f.notifier.count(uuid::SET_LOCK), 2);
        assert_eq!(handler.events.borrow()[1], (None, false));
    }

    #[test]
    fn invalid_lock_values_are_rejected() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer = Address::random(PEER_A);

        assert_eq!(member.write_set_lock(Some(&peer), 0, &[0x03]), Err(ERR_LOCK_INVALID_VALUE));
        assert_eq!(
            member.write_set_lock(Some(&peer), 0, &[0x01, 0x02]),
            Err(AttErrorCode::INVALID_ATTRIBUTE_VALUE_LENGTH)
        );
        assert_eq!(member.read_set_lock(), [RELEASE_VALUE]);
    }

    #[test]
    fn holder_can_release() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer_a = Address::random(PEER_A);
        f.connections.connect(peer_a);

        unwrap!(member.write_set_lock(Some(&peer_a), 0, &[LOCK_VALUE]).ok());
        unwrap!(member.write_set_lock(Some(&peer_a), 0, &[RELEASE_VALUE]).ok());
        assert!(!member.is_locked());

        // Releasing an already released lock is fine and changes nothing.
        f.notifier.clear();
        unwrap!(member.write_set_lock(Some(&peer_a), 0, &[RELEASE_VALUE]).ok());
        assert_eq!(f.notifier.count(uuid::SET_LOCK), 0);
    }

    #[test]
    fn server_lock_blocks_peer_release() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer = Address::random(PEER_A);

        unwrap!(member.lock(true, false).ok());
        assert_eq!(
            member.write_set_lock(Some(&peer), 0, &[RELEASE_VALUE]),
            Err(ERR_LOCK_RELEASE_DENIED)
        );
        unwrap!(member.lock(false, false).ok());
        assert!(!member.is_locked());
    }

    #[test]
    fn force_release_overrides_any_holder() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer = Address::random(PEER_A);
        f.connections.connect(peer);

        unwrap!(member.write_set_lock(Some(&peer), 0, &[LOCK_VALUE]).ok());
        unwrap!(member.lock(false, true).ok());
        assert!(!member.is_locked());
    }

    #[test]
    fn unbonded_holder_disconnect_releases() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer_a = Address::random(PEER_A);
        let peer_b = Address::random(PEER_B);
        f.connections.connect(peer_a);
        f.connections.connect(peer_b);

        unwrap!(member.write_set_lock(Some(&peer_a), 0, &[LOCK_VALUE]).ok());
        f.connections.disconnect(&peer_a);
        f.notifier.clear();

        member.on_disconnected(&peer_a);
        assert!(!member.is_locked());
        assert_eq!(unwrap!(f.notifier.last(uuid::SET_LOCK)).peer, Some(peer_b));
    }

    #[test]
    fn bonded_holder_disconnect_keeps_the_lock() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer_a = Address::random(PEER_A);
        f.bonds.add(peer_a);
        f.connections.connect(peer_a);

        unwrap!(member.write_set_lock(Some(&peer_a), 0, &[LOCK_VALUE]).ok());
        f.connections.disconnect(&peer_a);
        member.on_disconnected(&peer_a);
        assert!(member.is_locked());
    }

    #[test]
    fn missed_notification_is_delivered_on_security_change() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer_a = Address::random(PEER_A);
        let peer_b = Address::random(PEER_B);
        f.bonds.add(peer_b);
        f.connections.connect(peer_a);

        // B is bonded but offline when A takes the lock.
        member.on_pairing_complete(&peer_b, true);
        unwrap!(member.write_set_lock(Some(&peer_a), 0, &[LOCK_VALUE]).ok());
        assert_eq!(f.notifier.count(uuid::SET_LOCK), 0);

        // B reconnects and its link secures; the value arrives late.
        f.notifier.clear();
        member.on_security_changed(&peer_b);
        let delivered = unwrap!(f.notifier.last(uuid::SET_LOCK));
        assert_eq!(delivered.peer, Some(peer_b));
        assert_eq!(delivered.data[..], [LOCK_VALUE]);

        // Delivered once only.
        member.on_security_changed(&peer_b);
        assert_eq!(f.notifier.count(uuid::SET_LOCK), 1);
    }

    #[test]
    fn ledger_evicts_the_oldest_bond_when_full() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer_a = Address::random(PEER_A);
        let peer_b = Address::random(PEER_B);
        let peer_c = Address::random(PEER_C);

        member.on_pairing_complete(&peer_a, true);
        member.on_pairing_complete(&peer_b, true);
        // Re-pairing A refreshes its age, making B the oldest.
        member.on_pairing_complete(&peer_a, true);
        member.on_pairing_complete(&peer_c, true);

        let ledger = member.ledger();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.iter().any(|(addr, _, _)| *addr == peer_a));
        assert!(ledger.iter().any(|(addr, _, _)| *addr == peer_c));
    }

    #[test]
    fn full_ledger_drops_new_peer_when_eviction_disabled() {
        let f = Fixture::new();
        let member: Member<'_> = unwrap!(CoordinatedSetMember::new(
            &f.notifier,
            &f.bonds,
            &f.connections,
            &f.crypto,
            SetMemberConfig {
                evict_oldest: false,
                ..SetMemberConfig::default()
            },
            None,
        )
        .ok());
        let peer_a = Address::random(PEER_A);
        let peer_b = Address::random(PEER_B);
        let peer_c = Address::random(PEER_C);

        member.on_pairing_complete(&peer_a, true);
        member.on_pairing_complete(&peer_b, true);
        member.on_pairing_complete(&peer_c, true);

        let ledger = member.ledger();
        assert_eq!(ledger.len(), 2);
        assert!(!ledger.iter().any(|(addr, _, _)| *addr == peer_c));
    }

    #[test]
    fn unbonded_disconnect_drops_ledger_entry() {
        let f = Fixture::new();
        let member = f.member(None);
        let peer = Address::random(PEER_A);

        member.on_pairing_complete(&peer, true);
        assert_eq!(member.ledger().len(), 1);

        // The bond is gone by the time the disconnect arrives.
        member.on_disconnected(&peer);
        assert_eq!(member.ledger().len(), 0);
    }

    #[test]
    fn prand_skips_degenerate_values() {
        let f = Fixture::new();
        let member = f.member(None);

        // All-zero and all-one draws must be discarded.
        f.crypto.queue_rand(&[0x00, 0x00, 0x00]);
        f.crypto.queue_rand(&[0xff, 0xff, 0x3f]);
        f.crypto.queue_rand(&[0x12, 0x34, 0x01]);

        let psri = unwrap!(member.update_psri().ok());
        let prand = u32::from_le_bytes([psri[3], psri[4], psri[5], 0]);
        // Bit 22 set, bit 23 clear, random part preserved.
        assert_eq!(prand, 0x013412 | (1 << 22));
        assert_eq!(member.psri(), psri);
    }

    #[test]
    fn prand_generation_is_bounded() {
        let f = Fixture::new();
        let member = f.member(None);

        for _ in 0..PRAND_MAX_ATTEMPTS {
            f.crypto.queue_rand(&[0x00, 0x00, 0x00]);
        }
        assert!(member.update_psri().is_err());
    }

    #[test]
    fn psri_carries_the_sirk_hash() {
        let f = Fixture::new();
        let member = f.member(None);

        f.crypto.queue_rand(&[0x12, 0x34, 0x01]);
        let psri = unwrap!(member.update_psri().ok());

        let prand = u32::from_le_bytes([psri[3], psri[4], psri[5], 0]);
        let expected = unwrap!(sih(&f.crypto, &member.read_sirk(), prand).ok());
        assert_eq!(&psri[..3], &expected.to_le_bytes()[..3]);
    }
}
