use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};

use crate::{
    display::{DisplayEvent, DisplaySink},
    error::{Result, RigError},
    log_error, log_info, log_warn,
};

use super::{
    protocol::Command,
    state::ConnectionState,
    transport::{Characteristic, DeviceFilter, LinkTransport, Peripheral},
};

const ENABLE_LOGS: bool = true;

struct LinkInner {
    state: ConnectionState,
    peripheral: Option<Arc<dyn Peripheral>>,
    characteristic: Option<Arc<dyn Characteristic>>,
    /// Bumped on every connect attempt so callbacks from an older link are ignored.
    generation: u64,
    watcher: Option<JoinHandle<()>>,
}

enum Dispatch {
    Command(Command),
    Flush(oneshot::Sender<()>),
}

struct LinkCore {
    inner: Mutex<LinkInner>,
    transport: Arc<dyn LinkTransport>,
    sink: Arc<dyn DisplaySink>,
    filter: DeviceFilter,
    settle_delay: Duration,
}

/// Connection to the single rig peripheral.
///
/// Commands are fire-and-forget: a command issued while not connected is
/// dropped with a warning, never queued for later.
#[derive(Clone)]
pub struct DeviceLink {
    core: Arc<LinkCore>,
    dispatcher: Arc<OnceLock<mpsc::UnboundedSender<Dispatch>>>,
}

impl DeviceLink {
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        sink: Arc<dyn DisplaySink>,
        filter: DeviceFilter,
        settle_delay: Duration,
    ) -> Self {
        Self {
            core: Arc::new(LinkCore {
                inner: Mutex::new(LinkInner {
                    state: ConnectionState::Disconnected,
                    peripheral: None,
                    characteristic: None,
                    generation: 0,
                    watcher: None,
                }),
                transport,
                sink,
                filter,
                settle_delay,
            }),
            dispatcher: Arc::new(OnceLock::new()),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.core.inner.lock().await.state.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.core.inner.lock().await.state.is_connected()
    }

    /// Discovers the rig, opens its serial characteristic and, once the rig's
    /// display has had `settle_delay` to come up, sends the `CONN` handshake.
    pub async fn connect(&self) -> Result<()> {
        self.core.connect().await
    }

    /// Tears the link down. Does nothing unless connected.
    pub async fn disconnect(&self) {
        self.core.disconnect().await
    }

    /// The operator's single connect/disconnect button.
    pub async fn toggle(&self) -> Result<()> {
        if self.is_connected().await {
            self.disconnect().await;
            Ok(())
        } else {
            self.connect().await
        }
    }

    /// Writes one command and waits for the write to finish.
    pub async fn send(&self, command: Command) -> Result<()> {
        self.core.send(command).await
    }

    /// Queues a command for delivery without waiting. Commands dispatched from
    /// the same link are written in the order they were dispatched.
    pub fn dispatch(&self, command: Command) {
        if self.dispatcher().send(Dispatch::Command(command)).is_err() {
            log_error!("Command worker is gone; dropping {}", command);
        }
    }

    /// Waits until every command dispatched so far has been attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.dispatcher().send(Dispatch::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn dispatcher(&self) -> &mpsc::UnboundedSender<Dispatch> {
        self.dispatcher
            .get_or_init(|| spawn_dispatcher(self.core.clone()))
    }

    /// Called when the peripheral disconnects on its own.
    pub async fn handle_link_drop(&self) {
        let generation = self.core.inner.lock().await.generation;
        self.core.link_dropped(generation).await;
    }
}

fn spawn_dispatcher(core: Arc<LinkCore>) -> mpsc::UnboundedSender<Dispatch> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                Dispatch::Command(command) => {
                    if let Err(e) = core.send(command).await {
                        log_error!("Best-effort {} failed: {}", command, e);
                    }
                }
                Dispatch::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
    tx
}

impl LinkCore {
    fn emit_state(&self, state: &ConnectionState) {
        self.sink.emit(DisplayEvent::ConnectionChanged {
            status: state.clone(),
        });
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(RigError::invalid_state(inner.state.as_str(), "connect"));
                }
                ConnectionState::Disconnected | ConnectionState::Failed(_) => {}
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            inner.generation
        };
        self.emit_state(&ConnectionState::Connecting);
        log_info!("Connecting to rig (service {})", self.filter.service);

        match self.establish().await {
            Ok((peripheral, characteristic)) => {
                let name = peripheral.name();
                {
                    let mut inner = self.inner.lock().await;
                    inner.state = ConnectionState::Connected;
                    // Announced before the watcher exists so a drop can never
                    // reach the display ahead of it.
                    self.emit_state(&ConnectionState::Connected);
                    inner.watcher = Some(self.spawn_drop_watcher(&peripheral, generation));
                    inner.peripheral = Some(peripheral);
                    inner.characteristic = Some(characteristic);
                }
                log_info!("Connected to {}", name);
                self.spawn_handshake(generation);
                Ok(())
            }
            Err(err) => {
                log_error!("Rig connection failed: {}", err);
                let failed = ConnectionState::Failed(err.to_string());
                {
                    let mut inner = self.inner.lock().await;
                    inner.state = ConnectionState::Disconnected;
                }
                self.emit_state(&failed);
                self.sink.emit(DisplayEvent::error(err.to_string()));
                self.emit_state(&ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn establish(&self) -> Result<(Arc<dyn Peripheral>, Arc<dyn Characteristic>)> {
        let peripheral = self.transport.request_device(&self.filter).await?;

        let opened = async {
            peripheral.connect_gatt().await?;
            peripheral
                .open_characteristic(self.filter.service, self.filter.characteristic)
                .await
        }
        .await;

        match opened {
            Ok(characteristic) => Ok((peripheral, characteristic)),
            Err(e) => {
                peripheral.disconnect().await;
                Err(RigError::LinkEstablishFailed(e.to_string()))
            }
        }
    }

    fn spawn_drop_watcher(
        self: &Arc<Self>,
        peripheral: &Arc<dyn Peripheral>,
        generation: u64,
    ) -> JoinHandle<()> {
        let mut dropped = peripheral.subscribe_disconnect();
        let core = self.clone();
        tokio::spawn(async move {
            loop {
                if *dropped.borrow_and_update() {
                    break;
                }
                if dropped.changed().await.is_err() {
                    break;
                }
            }
            core.link_dropped(generation).await;
        })
    }

    fn spawn_handshake(self: &Arc<Self>, generation: u64) {
        let core = self.clone();
        tokio::spawn(async move {
            time::sleep(core.settle_delay).await;
            if core.inner.lock().await.generation != generation {
                return;
            }
            if let Err(e) = core.send(Command::Conn).await {
                log_error!("Handshake failed: {}", e);
            }
        });
    }

    async fn link_dropped(&self, generation: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || !inner.state.is_connected() {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.peripheral = None;
            inner.characteristic = None;
            inner.watcher = None;
        }
        log_warn!("Rig dropped the link");
        self.emit_state(&ConnectionState::Disconnected);
        self.sink.emit(DisplayEvent::warning("rig disconnected"));
    }

    async fn disconnect(&self) {
        let peripheral = {
            let mut inner = self.inner.lock().await;
            if !inner.state.is_connected() {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.characteristic = None;
            if let Some(watcher) = inner.watcher.take() {
                watcher.abort();
            }
            inner.peripheral.take()
        };

        if let Some(peripheral) = peripheral {
            peripheral.disconnect().await;
        }
        log_info!("Disconnected from rig");
        self.emit_state(&ConnectionState::Disconnected);
    }

    async fn send(&self, command: Command) -> Result<()> {
        let characteristic = {
            let inner = self.inner.lock().await;
            match (&inner.state, &inner.characteristic) {
                (ConnectionState::Connected, Some(characteristic)) => characteristic.clone(),
                _ => {
                    log_warn!("Rig not connected; dropping {}", command);
                    return Ok(());
                }
            }
        };

        match characteristic.write_value(&command.encode()).await {
            Ok(()) => {
                log_info!("Sent {}", command);
                Ok(())
            }
            Err(e) => {
                let err = RigError::SendFailed(e.to_string());
                log_error!("Send {} failed: {}", command, e);
                self.sink.emit(DisplayEvent::error(err.to_string()));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        display::ChannelSink,
        link::{
            protocol::{HM10_CHARACTERISTIC_UUID, HM10_SERVICE_UUID},
            SimulatedRig,
        },
    };
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    fn filter() -> DeviceFilter {
        DeviceFilter {
            service: HM10_SERVICE_UUID,
            characteristic: HM10_CHARACTERISTIC_UUID,
            name_prefix: None,
        }
    }

    fn link(rig: &SimulatedRig) -> (DeviceLink, UnboundedReceiver<DisplayEvent>) {
        let (sink, rx) = ChannelSink::new();
        let link = DeviceLink::new(
            Arc::new(rig.clone()),
            Arc::new(sink),
            filter(),
            Duration::from_millis(1500),
        );
        (link, rx)
    }

    fn connection_events(rx: &mut UnboundedReceiver<DisplayEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DisplayEvent::ConnectionChanged { status } = event {
                states.push(status);
            }
        }
        states
    }

    #[tokio::test(start_paused = true)]
    async fn connect_sends_handshake_after_settle_delay() {
        let rig = SimulatedRig::default();
        let (link, mut rx) = link(&rig);

        link.connect().await.unwrap();
        assert_eq!(link.state().await, ConnectionState::Connected);
        assert_eq!(
            connection_events(&mut rx),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(rig.written_lines().is_empty());

        time::sleep(Duration::from_millis(1499)).await;
        assert!(rig.written_lines().is_empty());
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rig.written_lines(), vec!["CONN"]);
        assert_eq!(rig.written_raw(), vec![b"CONN\n".to_vec()]);
    }

    #[tokio::test]
    async fn missing_peripheral_is_link_unavailable() {
        let rig = SimulatedRig::default();
        rig.set_present(false);
        let (link, mut rx) = link(&rig);

        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, RigError::LinkUnavailable(_)));
        assert_eq!(link.state().await, ConnectionState::Disconnected);

        let states = connection_events(&mut rx);
        assert_eq!(states.len(), 3);
        assert!(matches!(states[1], ConnectionState::Failed(_)));
        assert_eq!(states[2], ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancelled_chooser_is_link_unavailable() {
        let rig = SimulatedRig::default();
        rig.set_cancel_chooser(true);
        let (link, _rx) = link(&rig);
        assert!(matches!(
            link.connect().await,
            Err(RigError::LinkUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn gatt_failure_is_link_establish_failed_and_retryable() {
        let rig = SimulatedRig::default();
        rig.set_gatt_failure(true);
        let (link, _rx) = link(&rig);

        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, RigError::LinkEstablishFailed(_)));
        assert!(err.is_retryable());

        rig.set_gatt_failure(false);
        link.connect().await.unwrap();
        assert!(link.is_connected().await);
    }

    #[tokio::test]
    async fn wrong_characteristic_is_link_establish_failed() {
        let rig = SimulatedRig::default();
        let (sink, _rx) = ChannelSink::new();
        let link = DeviceLink::new(
            Arc::new(rig.clone()),
            Arc::new(sink),
            DeviceFilter {
                characteristic: Uuid::nil(),
                ..filter()
            },
            Duration::ZERO,
        );
        assert!(matches!(
            link.connect().await,
            Err(RigError::LinkEstablishFailed(_))
        ));
        assert!(!rig.is_connected());
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let rig = SimulatedRig::default();
        let (link, _rx) = link(&rig);
        link.connect().await.unwrap();
        assert_eq!(
            link.connect().await,
            Err(RigError::invalid_state("connected", "connect"))
        );
        assert_eq!(rig.connect_count(), 1);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_a_noop() {
        let rig = SimulatedRig::default();
        let (link, mut rx) = link(&rig);

        assert_eq!(link.send(Command::Run).await, Ok(()));
        assert_eq!(link.state().await, ConnectionState::Disconnected);
        assert!(rig.written_lines().is_empty());
        assert!(connection_events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn write_failure_keeps_connection() {
        let rig = SimulatedRig::default();
        let (link, mut rx) = link(&rig);
        link.connect().await.unwrap();
        connection_events(&mut rx);

        rig.set_write_failure(true);
        let err = link.send(Command::Run).await.unwrap_err();
        assert!(matches!(err, RigError::SendFailed(_)));
        assert_eq!(link.state().await, ConnectionState::Connected);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                DisplayEvent::Status { message, .. } => {
                    assert!(message.contains("write failed"));
                    saw_error = true;
                }
                DisplayEvent::ConnectionChanged { .. } => panic!("state must not change"),
                _ => {}
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn peripheral_drop_disconnects_and_notifies() {
        let rig = SimulatedRig::default();
        let (link, mut rx) = link(&rig);
        link.connect().await.unwrap();
        connection_events(&mut rx);

        rig.drop_link();
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            DisplayEvent::ConnectionChanged {
                status: ConnectionState::Disconnected
            }
        );
        assert_eq!(link.state().await, ConnectionState::Disconnected);

        link.send(Command::Stop).await.unwrap();
        assert!(rig.written_lines().is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let rig = SimulatedRig::default();
        let (link, mut rx) = link(&rig);

        link.disconnect().await;
        assert!(connection_events(&mut rx).is_empty());

        link.connect().await.unwrap();
        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(
            connection_events(&mut rx),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        assert!(!rig.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_is_skipped_after_reconnect() {
        let rig = SimulatedRig::default();
        let (link, _rx) = link(&rig);

        link.connect().await.unwrap();
        link.disconnect().await;
        link.connect().await.unwrap();

        time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(rig.written_lines(), vec!["CONN"]);
    }

    #[tokio::test]
    async fn dispatched_commands_keep_order() {
        let rig = SimulatedRig::default();
        let (sink, _rx) = ChannelSink::new();
        let link = DeviceLink::new(
            Arc::new(rig.clone()),
            Arc::new(sink),
            filter(),
            Duration::from_secs(60),
        );
        link.connect().await.unwrap();

        link.dispatch(Command::Run);
        link.dispatch(Command::Stop);
        link.dispatch(Command::Run);
        link.flush().await;

        assert_eq!(rig.written_lines(), vec!["RUN", "STOP", "RUN"]);
    }

    #[tokio::test]
    async fn stale_drop_leaves_newer_link_alone() {
        let rig = SimulatedRig::default();
        let (link, mut rx) = link(&rig);

        link.connect().await.unwrap();
        let first = link.core.inner.lock().await.generation;
        link.disconnect().await;
        link.connect().await.unwrap();
        connection_events(&mut rx);

        link.core.link_dropped(first).await;
        assert_eq!(link.state().await, ConnectionState::Connected);
        assert!(connection_events(&mut rx).is_empty());

        link.send(Command::Run).await.unwrap();
        assert_eq!(rig.written_lines(), vec!["RUN"]);
    }

    #[tokio::test]
    async fn reported_drop_disconnects_current_link() {
        let rig = SimulatedRig::default();
        let (link, mut rx) = link(&rig);

        link.handle_link_drop().await;
        assert!(connection_events(&mut rx).is_empty());

        link.connect().await.unwrap();
        connection_events(&mut rx);
        link.handle_link_drop().await;
        assert_eq!(link.state().await, ConnectionState::Disconnected);
        assert_eq!(
            connection_events(&mut rx),
            vec![ConnectionState::Disconnected]
        );

        link.connect().await.unwrap();
        assert!(link.is_connected().await);
    }

    #[tokio::test]
    async fn wrong_service_is_link_unavailable() {
        let rig = SimulatedRig::default();
        rig.set_service(Uuid::nil());
        let (link, _rx) = link(&rig);
        assert!(matches!(
            link.connect().await,
            Err(RigError::LinkUnavailable(_))
        ));
        assert_eq!(rig.connect_count(), 0);
    }

    /// Hands out a peripheral that is already gone by the time it is watched.
    struct VanishingTransport;

    struct VanishingPeripheral;

    struct SinkholeCharacteristic;

    #[async_trait::async_trait]
    impl LinkTransport for VanishingTransport {
        async fn request_device(
            &self,
            _filter: &DeviceFilter,
        ) -> std::result::Result<Arc<dyn Peripheral>, crate::error::TransportError> {
            Ok(Arc::new(VanishingPeripheral))
        }
    }

    #[async_trait::async_trait]
    impl Peripheral for VanishingPeripheral {
        fn name(&self) -> String {
            "vanishing".into()
        }

        async fn connect_gatt(&self) -> std::result::Result<(), crate::error::TransportError> {
            Ok(())
        }

        async fn open_characteristic(
            &self,
            _service: Uuid,
            _characteristic: Uuid,
        ) -> std::result::Result<Arc<dyn Characteristic>, crate::error::TransportError> {
            Ok(Arc::new(SinkholeCharacteristic))
        }

        fn subscribe_disconnect(&self) -> tokio::sync::watch::Receiver<bool> {
            tokio::sync::watch::channel(true).1
        }

        async fn disconnect(&self) {}
    }

    #[async_trait::async_trait]
    impl Characteristic for SinkholeCharacteristic {
        async fn write_value(
            &self,
            _bytes: &[u8],
        ) -> std::result::Result<(), crate::error::TransportError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn immediate_drop_is_shown_after_connected() {
        let (sink, mut rx) = ChannelSink::new();
        let link = DeviceLink::new(
            Arc::new(VanishingTransport),
            Arc::new(sink),
            filter(),
            Duration::from_secs(60),
        );

        link.connect().await.unwrap();
        let mut states = Vec::new();
        while states.last() != Some(&ConnectionState::Disconnected) {
            if let Some(DisplayEvent::ConnectionChanged { status }) = rx.recv().await {
                states.push(status);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn toggle_flips_connection() {
        let rig = SimulatedRig::default();
        let (link, _rx) = link(&rig);
        link.toggle().await.unwrap();
        assert!(link.is_connected().await);
        link.toggle().await.unwrap();
        assert!(!link.is_connected().await);
    }
}
