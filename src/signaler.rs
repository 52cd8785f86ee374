use crate::config::SignalConfig;
use crate::error::SignalError;
use crate::logger::LogSink;
use crate::peer::connection::{Callbacks, Session};
use crate::peer::rtc::RtcTransportFactory;
use crate::peer::transport::TransportFactory;
use crate::peer::types::Role;
use crate::registry::HostRegistry;
use std::sync::Arc;

/// Entry point owned by the application: transport, config, log and callbacks
/// for every session it creates. Independent signalers share nothing.
#[derive(Clone)]
pub struct Signaler {
    factory: Arc<dyn TransportFactory>,
    config: Arc<SignalConfig>,
    log: LogSink,
    callbacks: Callbacks,
}

impl Signaler {
    pub fn new(factory: Arc<dyn TransportFactory>, config: SignalConfig) -> Self {
        let log = if config.logging_enabled {
            LogSink::console()
        } else {
            LogSink::disabled()
        };
        Self {
            factory,
            config: Arc::new(config),
            log,
            callbacks: Callbacks::default(),
        }
    }

    /// Signaler backed by real WebRTC peer connections
    pub fn rtc(config: SignalConfig) -> Self {
        let factory = Arc::new(RtcTransportFactory::new(config.clone()));
        Self::new(factory, config)
    }

    pub fn with_log(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub(crate) fn factory(&self) -> &dyn TransportFactory {
        self.factory.as_ref()
    }

    pub(crate) fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// A peer session starts producing its offer right away; a host session
    /// waits in `AWAITING_REMOTE` for one.
    pub async fn create_session(&self, role: Role) -> Result<Session, SignalError> {
        Session::create(self, role, None).await
    }

    pub fn host_registry(&self) -> HostRegistry {
        HostRegistry::new(self.clone())
    }
}
