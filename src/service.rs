//! `OtaService` — owns and wires components A–G, mirroring the teacher's
//! `AppService`: a single hardware-agnostic facade that the binary's event
//! loop drives, generic over the port traits rather than a concrete
//! adapter set.
//!
//! Root and leaf devices run the same binary; which methods are
//! meaningful depends on [`MeshTransportPort::is_root`]. The root calls
//! `start_download`/`start_distribution`/`initiate_reboot`; every device
//! calls `dispatch_frame` for inbound mesh traffic and `tick` for the
//! periodic housekeeping (leaf inactivity watchdog).
//!
//! Root-only methods take `&self`, not `&mut self`: per the concurrency
//! model, a root runs the mesh receive loop (feeding `on_ack` into the
//! distributor/reboot coordinator) on a thread separate from whichever
//! thread calls `start_distribution`/`initiate_reboot` and blocks waiting
//! on those acks. `Downloader`'s single mutable field is therefore behind
//! a `Mutex` here too, even though nothing else touches it concurrently,
//! so the whole root-side API is uniformly shareable.

use std::sync::Mutex;

use log::{info, warn};

use crate::distributor::DistributionSession;
use crate::downloader::Downloader;
use crate::error::{OtaError, Result};
use crate::ports::{ClockPort, HttpClientPort, KvStorePort, MacAddr, MeshTransportPort, PartitionPort};
use crate::reboot::RebootCoordinator;
use crate::receiver::Receiver;
use crate::rollback;
use crate::router::{self, Role, Route};
use crate::wire::{self, Cmd};

pub struct OtaService {
    running_version: String,
    downloader: Mutex<Downloader>,
    distributor: DistributionSession,
    receiver: Receiver,
    reboot: RebootCoordinator,
}

impl OtaService {
    pub fn new(running_version: impl Into<String>) -> Self {
        Self {
            running_version: running_version.into(),
            downloader: Mutex::new(Downloader::new()),
            distributor: DistributionSession::new(),
            receiver: Receiver::new(),
            reboot: RebootCoordinator::new(),
        }
    }

    pub fn running_version(&self) -> &str {
        &self.running_version
    }

    pub fn download_state(&self) -> crate::downloader::DownloadState {
        self.downloader.lock().unwrap().state()
    }

    pub fn distribution(&self) -> &DistributionSession {
        &self.distributor
    }

    pub fn receiver_state(&self) -> crate::receiver::ReceiverState {
        self.receiver.state()
    }

    pub fn reboot_coordinator(&self) -> &RebootCoordinator {
        &self.reboot
    }

    /// Root only: component A. Fetches `url` into the inactive partition.
    pub fn start_download<P, H, C>(&self, url: &str, partition: &mut P, http: &mut H, clock: &C) -> Result<()>
    where
        P: PartitionPort,
        H: HttpClientPort,
        C: ClockPort,
    {
        self.downloader
            .lock()
            .unwrap()
            .download(url, partition, http, clock, &self.running_version)
    }

    /// Root only: component C. Pushes the staged image to every routed node.
    pub fn start_distribution<P, T, C>(
        &self,
        partition: &P,
        transport: &mut T,
        clock: &C,
        on_progress: impl FnMut(f32),
    ) -> Result<()>
    where
        P: PartitionPort,
        T: MeshTransportPort,
        C: ClockPort,
    {
        self.distributor
            .distribute(partition, transport, clock, &self.running_version, on_progress)
    }

    /// Root only: component E. Runs the two-phase PREPARE/REBOOT handshake.
    pub fn initiate_reboot<P, T, K, C>(
        &self,
        partition: &mut P,
        transport: &mut T,
        kv: &mut K,
        clock: &C,
        timeout_seconds: u16,
        reboot_delay_ms: u16,
    ) -> Result<()>
    where
        P: PartitionPort,
        T: MeshTransportPort,
        K: KvStorePort,
        C: ClockPort,
    {
        self.reboot
            .initiate(&self.distributor, partition, transport, kv, clock, timeout_seconds, reboot_delay_ms)
    }

    /// Leaf housekeeping: call periodically (e.g. once per control tick).
    pub fn tick<P, C>(&mut self, partition: &mut P, clock: &C)
    where
        P: PartitionPort,
        C: ClockPort,
    {
        self.receiver.check_inactivity(partition, clock);
    }

    /// Mesh disconnection notification: discard any partial reception.
    pub fn on_disconnect<P: PartitionPort>(&mut self, partition: &mut P) {
        self.receiver.on_disconnect(partition);
    }

    /// Dispatch one inbound mesh frame through the router (component G) to
    /// the owning component, replying over `transport` where the protocol
    /// calls for an ACK. `from` is the sender's mesh address.
    pub fn dispatch_frame<P, T, K, C>(
        &mut self,
        role: Role,
        from: MacAddr,
        frame: &[u8],
        partition: &mut P,
        transport: &mut T,
        kv: &mut K,
        clock: &C,
    ) -> Result<()>
    where
        P: PartitionPort,
        T: MeshTransportPort,
        K: KvStorePort,
        C: ClockPort,
    {
        match router::route(role, frame)? {
            Route::Dropped => Ok(()),
            Route::Distributor => self.dispatch_root_frame(from, frame),
            Route::Receiver => self.dispatch_to_receiver(frame, partition, clock, transport),
            Route::RebootCoordinator => {
                self.dispatch_to_reboot_coordinator(frame, partition, kv, transport, clock)
            }
        }
    }

    /// Root-side handling of an inbound frame already classified as
    /// [`Route::Distributor`] by the router. Takes `&self`: safe to call
    /// from the mesh receive loop's own thread concurrently with a
    /// `start_distribution`/`initiate_reboot` call blocking on another.
    pub fn dispatch_root_frame(&self, from: MacAddr, frame: &[u8]) -> Result<()> {
        match Cmd::from_byte(frame[0]) {
            Some(Cmd::OtaAck) => {
                let ack = wire::Ack::decode(frame)?;
                // An inbound ACK is ambiguous between the two root-side
                // sessions that consume them (block transfer vs. reboot
                // readiness) since both use the same wire shape; the
                // currently-coordinating session, if any, takes it.
                if self.reboot.is_coordinating() {
                    self.reboot.on_ack(from, ack);
                } else {
                    self.distributor.on_ack(from, ack);
                }
                Ok(())
            }
            Some(Cmd::OtaRequest) => {
                info!("service: OTA_REQUEST from {:02x?}, ignoring (distribution is operator-triggered)", from.0);
                Ok(())
            }
            Some(Cmd::OtaStatus) => {
                info!("service: OTA_STATUS from {:02x?}", from.0);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn dispatch_to_receiver<P, C, T>(&mut self, frame: &[u8], partition: &mut P, clock: &C, transport: &mut T) -> Result<()>
    where
        P: PartitionPort,
        C: ClockPort,
        T: MeshTransportPort,
    {
        match Cmd::from_byte(frame[0]) {
            Some(Cmd::OtaStart) => {
                let start = wire::Start::decode(frame)?;
                self.receiver
                    .on_start(partition, start.total_blocks, start.firmware_size, start.version)
            }
            Some(Cmd::OtaBlock) => {
                // An undersized frame can't be decoded at all, but spec
                // §4.5 step 1 still calls for an InvalidSize ACK rather
                // than silence — the distributor otherwise waits out the
                // full ACK_TIMEOUT_MS before retransmitting.
                let ack = match wire::decode_block(frame) {
                    Ok((header, payload)) => self.receiver.on_block(partition, clock, header, payload),
                    Err(_) => wire::Ack::err(wire::block_no_hint(frame)),
                };
                self.reply(transport, Receiver::ack_destination(transport), &ack)
            }
            _ => Ok(()),
        }
    }

    fn dispatch_to_reboot_coordinator<P, K, T, C>(
        &mut self,
        frame: &[u8],
        partition: &mut P,
        kv: &mut K,
        transport: &mut T,
        clock: &C,
    ) -> Result<()>
    where
        P: PartitionPort,
        K: KvStorePort,
        T: MeshTransportPort,
        C: ClockPort,
    {
        match Cmd::from_byte(frame[0]) {
            Some(Cmd::OtaPrepareReboot) => {
                let _prepare = wire::PrepareReboot::decode(frame)?;
                let ack = self.receiver.on_prepare_reboot(partition);
                self.reply(transport, Receiver::ack_destination(transport), &ack)
            }
            Some(Cmd::OtaReboot) => {
                let reboot = wire::Reboot::decode(frame)?;
                match self.receiver.on_reboot(partition, kv, &self.running_version) {
                    Ok(()) => {
                        let ack = wire::Ack::ok(0);
                        self.reply(transport, Receiver::ack_destination(transport), &ack)?;
                        clock.sleep_ms(u32::from(reboot.delay_ms));
                        partition.restart();
                        Ok(())
                    }
                    Err(e) => {
                        warn!("service: REBOOT commit rejected ({e}), notifying root");
                        let ack = wire::Ack::err(0);
                        self.reply(transport, Receiver::ack_destination(transport), &ack)?;
                        Err(e)
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn reply<T: MeshTransportPort>(&self, transport: &mut T, to: MacAddr, ack: &wire::Ack) -> Result<()> {
        let mut frame = [0u8; wire::Ack::WIRE_LEN];
        ack.encode(&mut frame)?;
        transport.send(to, &frame)
    }
}

/// Boot-time entry point, run before the mesh stack starts: resolves the
/// rollback decision table and starts the connectivity watchdog thread
/// when the decision calls for one.
pub fn run_boot_rollback_check<P, T, K, C>(partition: &mut P, transport: T, kv: K, clock: C) -> Result<rollback::BootAction>
where
    P: PartitionPort,
    T: MeshTransportPort + Send + 'static,
    K: KvStorePort + Send + 'static,
    C: ClockPort + Send + 'static,
{
    let mut kv = kv;
    let action = rollback::check_rollback(partition, &mut kv)?;
    if action == rollback::BootAction::NormalBootWithWatchdog {
        rollback::spawn_connectivity_watchdog(transport, kv, clock);
    }
    Ok(action)
}
