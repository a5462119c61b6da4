/* General action vocabulary of the command chain and its sink.
 *
 * Macros, infrared playback and calibration are carried out by collaborators
 * outside the pipeline (reached through the `Collaborators` trait); a
 * configuration switch is handed to the switcher queue without waiting. */

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::chain::{ActionSink, CommandChain, SinkError};
use crate::slot::AnalogConfig;
use crate::storage::SlotStorage;
use crate::switcher::{SwitchError, SwitchRequest, SwitcherHandle};
use crate::vb::{Edge, VirtualButton};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneralAction {
    Macro(String),
    Infrared(String),
    Calibrate,
    SwitchSlot(SwitchRequest),
}

impl fmt::Display for GeneralAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneralAction::Macro(text) => write!(f, "macro '{text}'"),
            GeneralAction::Infrared(name) => write!(f, "infrared '{name}'"),
            GeneralAction::Calibrate => f.write_str("calibrate"),
            GeneralAction::SwitchSlot(req) => write!(f, "switch {req}"),
        }
    }
}

pub type ActionChain = CommandChain<GeneralAction, GeneralSink>;

/// Subsystems outside the event pipeline that general actions and slot
/// switches call into.
#[async_trait]
pub trait Collaborators: Send + Sync {
    async fn run_macro(&self, text: &str) -> Result<()>;

    async fn play_infrared(&self, name: &str) -> Result<()>;

    /* Re-zero the analog sensors. */
    async fn calibrate(&self) -> Result<()>;

    async fn reconfigure_analog(&self, analog: &AnalogConfig) -> Result<()>;

    /* User feedback (buzzer/LED) for the slot that just became active. */
    async fn acknowledge_slot(&self, ordinal: u32) -> Result<()>;
}

/* Fires general actions: collaborator calls and switcher requests. */
pub struct GeneralSink {
    collaborators: Arc<dyn Collaborators>,
    switcher: SwitcherHandle,
}

impl GeneralSink {
    pub fn new(collaborators: Arc<dyn Collaborators>, switcher: SwitcherHandle) -> Self {
        Self {
            collaborators,
            switcher,
        }
    }
}

fn collaborator_error(e: anyhow::Error) -> SinkError {
    SinkError::Collaborator(format!("{e:#}"))
}

#[async_trait]
impl ActionSink<GeneralAction> for GeneralSink {
    fn vocabulary(&self) -> &'static str {
        "action"
    }

    async fn fire(&self, vb: Option<VirtualButton>, edge: Edge, action: &GeneralAction) -> Result<(), SinkError> {
        debug!("Action {} for {:?}/{}", action, vb, edge);
        match action {
            GeneralAction::Macro(text) => self.collaborators.run_macro(text).await.map_err(collaborator_error),
            GeneralAction::Infrared(name) => self.collaborators.play_infrared(name).await.map_err(collaborator_error),
            GeneralAction::Calibrate => self.collaborators.calibrate().await.map_err(collaborator_error),
            GeneralAction::SwitchSlot(req) => self.switcher.try_request(req.clone()).map_err(|e| match e {
                SwitchError::QueueFull => SinkError::QueueFull("switcher"),
                _ => SinkError::QueueClosed("switcher"),
            }),
        }
    }
}

/* ------------------------------------------------------------------ */
/* Default collaborators                                                */
/* ------------------------------------------------------------------ */

/* Stand-in used by the daemon: logs every request and resolves infrared
 * recordings from storage so a missing one is reported as an error. */
pub struct LoggingCollaborators {
    storage: Arc<SlotStorage>,
    transaction_timeout: Duration,
}

impl LoggingCollaborators {
    pub fn new(storage: Arc<SlotStorage>, transaction_timeout: Duration) -> Self {
        Self {
            storage,
            transaction_timeout,
        }
    }
}

#[async_trait]
impl Collaborators for LoggingCollaborators {
    async fn run_macro(&self, text: &str) -> Result<()> {
        info!("Macro: {}", text);
        Ok(())
    }

    async fn play_infrared(&self, name: &str) -> Result<()> {
        let tx = self.storage.start("infrared", self.transaction_timeout).await?;
        let loaded = self.storage.load_ir(&tx, name).await;
        self.storage.finish(tx)?;
        let rec = loaded.with_context(|| format!("Playing infrared recording '{name}'"))?;
        info!(
            "Infrared '{}': {} edges, {} us",
            rec.name,
            rec.items.len(),
            rec.duration_us()
        );
        Ok(())
    }

    async fn calibrate(&self) -> Result<()> {
        info!("Calibrating analog sensors");
        Ok(())
    }

    async fn reconfigure_analog(&self, analog: &AnalogConfig) -> Result<()> {
        debug!("Analog settings: {:?}", analog);
        Ok(())
    }

    async fn acknowledge_slot(&self, ordinal: u32) -> Result<()> {
        info!("Slot {} active", ordinal);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::flags::{EventFlags, CMD_QUEUE_IDLE, CONFIG_STABLE};
    use crate::storage::IrRecording;
    use crate::switcher;
    use crate::vb::Trigger;

    /* Records every collaborator call as a short string. */
    #[derive(Default)]
    pub(crate) struct RecordingCollaborators {
        pub calls: StdMutex<Vec<String>>,
    }

    impl RecordingCollaborators {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> Result<()> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl Collaborators for RecordingCollaborators {
        async fn run_macro(&self, text: &str) -> Result<()> {
            if text == "fail" {
                anyhow::bail!("macro interpreter rejected '{text}'");
            }
            self.record(format!("macro:{text}"))?;
            if text == "slow" {
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
            Ok(())
        }

        async fn play_infrared(&self, name: &str) -> Result<()> {
            self.record(format!("ir:{name}"))
        }

        async fn calibrate(&self) -> Result<()> {
            self.record("calibrate".into())
        }

        async fn reconfigure_analog(&self, analog: &AnalogConfig) -> Result<()> {
            self.record(format!("analog:{:?}", analog.mode))
        }

        async fn acknowledge_slot(&self, ordinal: u32) -> Result<()> {
            self.record(format!("ack:{ordinal}"))
        }
    }

    fn vb(id: u32) -> VirtualButton {
        VirtualButton::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_general_sink_routes_actions() {
        let collab = Arc::new(RecordingCollaborators::default());
        let (handle, _inbox) = switcher::channel(1);
        let flags = EventFlags::new(CONFIG_STABLE | CMD_QUEUE_IDLE);
        let chain = ActionChain::new(
            GeneralSink::new(collab.clone(), handle),
            flags,
            Duration::from_millis(50),
        );

        chain.add(Trigger::Button(vb(3)), Edge::Press, GeneralAction::Macro("KP a".into()), None, false).await.unwrap();
        chain.add(Trigger::Button(vb(3)), Edge::Press, GeneralAction::Calibrate, None, false).await.unwrap();
        chain.add(Trigger::Button(vb(3)), Edge::Release, GeneralAction::Infrared("tv".into()), None, false).await.unwrap();

        assert_eq!(chain.dispatch(vb(3), Edge::Press).await.unwrap(), 2);
        assert_eq!(collab.calls(), ["macro:KP a", "calibrate"]);
        assert_eq!(chain.dispatch(vb(3), Edge::Release).await.unwrap(), 1);
        assert_eq!(collab.calls().last().map(String::as_str), Some("ir:tv"));
    }

    #[tokio::test]
    async fn test_switch_action_fills_switcher_queue() {
        let collab = Arc::new(RecordingCollaborators::default());
        let (handle, _inbox) = switcher::channel(1);
        let sink = GeneralSink::new(collab, handle);

        let next = GeneralAction::SwitchSlot(SwitchRequest::Next);
        sink.fire(Some(vb(2)), Edge::Press, &next).await.unwrap();
        assert_eq!(
            sink.fire(Some(vb(2)), Edge::Press, &next).await,
            Err(SinkError::QueueFull("switcher"))
        );
    }

    #[tokio::test]
    async fn test_collaborator_failure_surfaces_as_sink_error() {
        let collab = Arc::new(RecordingCollaborators::default());
        let (handle, _inbox) = switcher::channel(1);
        let sink = GeneralSink::new(collab, handle);
        let err = sink
            .fire(None, Edge::Press, &GeneralAction::Macro("fail".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Collaborator(msg) if msg.contains("rejected")));
    }

    #[tokio::test]
    async fn test_logging_collaborators_resolve_infrared() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SlotStorage::open(dir.path()).await.unwrap());
        let tx = storage.start("test", Duration::from_millis(50)).await.unwrap();
        storage
            .store_ir(&tx, &IrRecording { name: "tv".into(), items: vec![0x8000_0100] })
            .await
            .unwrap();
        storage.finish(tx).unwrap();

        let collab = LoggingCollaborators::new(storage, Duration::from_millis(50));
        collab.play_infrared("tv").await.unwrap();
        let err = collab.play_infrared("radio").await.unwrap_err();
        assert!(format!("{err:#}").contains("radio"));
    }
}
