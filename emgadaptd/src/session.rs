//! Session orchestrator.
//!
//! Startup order: model → sensor stream → context socket → handshake →
//! classifier loop + adaptation manager. Every task is owned by a
//! `JoinHandle` here and shares one cancellation token; shutdown cancels it
//! and waits for all of them before the final model is written.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use emgadapt::classifier::{Checkpoint, Classifier, CosineClassifier, Head};
use emgadapt::features::{FeatureExtractor, TimeDomainFeatures};
use emgadapt::lda::LdaClassifier;
use emgadapt::memory::Memory;
use emgadapt::prediction_log::{LogCursor, PredictionLogWriter};
use emgadapt::prng::Prng;
use emgadapt::registry::ModelRegistry;

use crate::adaptation::{AdaptationManager, AdaptationStats};
use crate::classifier_loop::{ClassifierLoop, LoopStats};
use crate::config::{HeadKind, SessionConfig};
use crate::context::ContextChannel;
use crate::error::SessionError;
use crate::handshake;
use crate::paths::SessionPaths;
use crate::sensor;

/// Windows buffered between the sensor task and the classifier loop.
const WINDOW_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub classifier: LoopStats,
    pub adaptation: AdaptationStats,
    /// Successful model updates during the session.
    pub generation: u64,
    pub final_model: PathBuf,
}

pub struct Session {
    config: SessionConfig,
    paths: SessionPaths,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let paths = SessionPaths::new(config.session_dir.as_deref())?;
        Ok(Self { config, paths })
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Run until `shutdown` fires, the sensor stream ends or a fatal error.
    /// Once the model exists it is checkpointed exactly once on the way out,
    /// whatever the outcome.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SessionSummary, SessionError> {
        let extractor = TimeDomainFeatures::default();
        let (model, warm_memory) = self.initial_model(&extractor)?;
        let registry = Arc::new(ModelRegistry::new(model));

        let served = self
            .serve(Arc::clone(&registry), extractor, warm_memory, shutdown)
            .await;
        let saved = self.save_final(&registry);

        let (classifier, adaptation) = served?;
        Ok(SessionSummary {
            classifier,
            adaptation,
            generation: registry.generation(),
            final_model: saved?,
        })
    }

    fn initial_model(
        &self,
        extractor: &TimeDomainFeatures,
    ) -> Result<(Head, Option<Memory>), SessionError> {
        let num_classes = self.config.num_classes;
        let dim = extractor.feature_dim(self.config.sensor.channels);

        let warm = match &self.config.warm_start_dir {
            Some(dir) => {
                let m = Memory::load_all(dir)?;
                info!("Loaded {} records from {:?}", m.len(), dir);
                Some(m)
            }
            None => None,
        };

        let model = match &self.config.model_path {
            Some(path) => {
                let m = Head::load_checkpoint(path).map_err(|e| {
                    SessionError::Config(format!("cannot load model {}: {e}", path.display()))
                })?;
                if m.dim() != dim || m.num_classes() != num_classes {
                    return Err(SessionError::Config(format!(
                        "model {} is {}x{}, session needs {}x{}",
                        path.display(),
                        m.num_classes(),
                        m.dim(),
                        num_classes,
                        dim
                    )));
                }
                info!("{} model loaded from {:?}", m.kind(), path);
                m
            }
            None => {
                let mut m: Head = match self.config.head {
                    HeadKind::Cosine => CosineClassifier::new(num_classes, dim).into(),
                    HeadKind::Lda => LdaClassifier::new(num_classes, dim).into(),
                };
                if let Some(mem) = warm.as_ref().filter(|w| !w.is_empty()) {
                    let (x, y) = mem.training_set();
                    match m.fit(&x, mem.dim(), &y) {
                        Ok(()) => info!("Fresh model warm-started on {} records", y.len()),
                        Err(e) => warn!("Warm start failed, starting untrained: {}", e),
                    }
                }
                m
            }
        };

        // Only contextual memory can be merged with what this session collects.
        let warm = warm.filter(|w| w.has_context() && w.dim() == dim);
        Ok((model, warm))
    }

    async fn serve(
        &self,
        registry: Arc<ModelRegistry<Head>>,
        extractor: TimeDomainFeatures,
        warm_memory: Option<Memory>,
        shutdown: CancellationToken,
    ) -> Result<(LoopStats, AdaptationStats), SessionError> {
        let cfg = &self.config;
        let cancel = shutdown.child_token();

        let (tx, rx) = mpsc::channel(WINDOW_QUEUE);
        let source = sensor::start_source(&cfg.sensor, tx, cancel.clone()).await?;

        let setup = async {
            let context =
                ContextChannel::bind(&format!("{}:{}", cfg.bind_host, cfg.context_port)).await?;
            info!("Context channel on {}", context.local_addr()?);
            let reply = self.paths.session_dir().display().to_string();
            handshake::handshake(
                &format!("{}:{}", cfg.bind_host, cfg.handshake_port),
                &reply,
                cfg.handshake_timeout(),
            )
            .await?;
            let log = PredictionLogWriter::create(&self.paths.preds_log())?;

            let rng = cfg.seed.map_or_else(Prng::from_time, Prng::new);
            let mut manager = AdaptationManager::new(
                Arc::clone(&registry),
                LogCursor::new(&self.paths.preds_log(), cfg.num_classes),
                cfg.num_classes,
                cfg.fit_strategy,
                rng,
            );
            if cfg.persist_memory {
                manager = manager.persist_to(self.paths.memory_dir())?;
            }
            if let Some(m) = warm_memory {
                manager = manager.with_memory(m);
            }
            Ok::<_, SessionError>((context, log, manager))
        };
        let (context, log, manager) = match setup.await {
            Ok(v) => v,
            Err(e) => {
                cancel.cancel();
                let _ = source.await;
                return Err(e);
            }
        };

        let classifier = ClassifierLoop::new(
            Arc::clone(&registry),
            extractor,
            cfg.majority_vote,
            cfg.rejection_threshold,
            log,
        );
        let mut classifier_task = tokio::spawn(classifier.run(rx, cancel.clone()));
        let mut manager_task =
            tokio::spawn(manager.run(context, cfg.context_timeout(), cancel.clone()));
        info!("Session running");

        let mut classifier_done = None;
        let mut manager_done = None;
        tokio::select! {
            _ = cancel.cancelled() => info!("Shutdown requested"),
            r = &mut classifier_task => {
                info!("Sensor stream ended; shutting down");
                classifier_done = Some(r);
            }
            r = &mut manager_task => {
                warn!("Adaptation manager exited early; shutting down");
                manager_done = Some(r);
            }
        }
        cancel.cancel();

        let classifier_res = match classifier_done {
            Some(r) => r,
            None => classifier_task.await,
        };
        let manager_res = match manager_done {
            Some(r) => r,
            None => manager_task.await,
        };
        let source_res = source.await;

        let loop_stats = classifier_res?;
        let adaptation = manager_res??;
        source_res?;
        Ok((loop_stats, adaptation))
    }

    fn save_final(
        &self,
        registry: &ModelRegistry<Head>,
    ) -> Result<PathBuf, SessionError> {
        let path = self.paths.final_model();
        info!("Saving model ({:?})...", path);
        match registry.snapshot_owned().save_checkpoint(&path) {
            Ok(()) => {
                info!("✓ Model saved (generation {})", registry.generation());
                Ok(path)
            }
            Err(e) => {
                error!("Failed to save model to {:?}: {}", path, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::Path;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, UdpSocket};

    use crate::config::{SensorConfig, SensorSource};

    async fn free_udp_port() -> u16 {
        let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        s.local_addr().unwrap().port()
    }

    fn write_recording(path: &Path, rows: usize) {
        let mut f = std::fs::File::create(path).unwrap();
        for i in 0..rows {
            let v = (i as f32 * 0.7).sin();
            writeln!(f, "{},{}", v, -v).unwrap();
        }
    }

    async fn base_config(dir: &Path) -> SessionConfig {
        SessionConfig {
            num_classes: 3,
            handshake_port: free_udp_port().await,
            context_port: free_udp_port().await,
            handshake_timeout_ms: 50,
            context_timeout_ms: 50,
            session_dir: Some(dir.join("session")),
            seed: Some(1),
            sensor: SensorConfig {
                source: SensorSource::Csv {
                    path: dir.join("rec.csv"),
                    sample_rate_hz: 0.0,
                },
                channels: 2,
                window_size: 20,
                window_increment: 10,
            },
            ..SessionConfig::default()
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn missing_stream_is_fatal_but_model_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config(dir.path()).await;
        let session = Session::new(cfg).unwrap();
        let final_model = session.paths().final_model();
        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::StreamUnavailable(_)));
        assert!(final_model.exists());
    }

    #[tokio::test]
    async fn handshake_timeout_is_fatal_but_model_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(&dir.path().join("rec.csv"), 100);
        let cfg = base_config(dir.path()).await;
        let session = Session::new(cfg).unwrap();
        let final_model = session.paths().final_model();
        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout(_)));
        let saved = CosineClassifier::load_checkpoint(&final_model).unwrap();
        assert_eq!(saved.dim(), 10);
    }

    #[tokio::test]
    async fn checkpoint_with_wrong_shape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("m.emgm");
        CosineClassifier::new(3, 4).save_checkpoint(&model_path).unwrap();
        let mut cfg = base_config(dir.path()).await;
        cfg.model_path = Some(model_path);
        let err = Session::new(cfg)
            .unwrap()
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[tokio::test]
    async fn checkpoint_head_overrides_configured_head() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("m.emgm");
        LdaClassifier::new(3, 10).save_checkpoint(&model_path).unwrap();
        let mut cfg = base_config(dir.path()).await;
        cfg.model_path = Some(model_path);
        cfg.head = HeadKind::Cosine;
        let session = Session::new(cfg).unwrap();
        let (model, _) = session
            .initial_model(&TimeDomainFeatures::default())
            .unwrap();
        assert_eq!(model.kind(), "lda");
    }

    #[tokio::test]
    async fn lda_head_is_saved_as_lda() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(&dir.path().join("rec.csv"), 100);
        let mut cfg = base_config(dir.path()).await;
        cfg.head = HeadKind::Lda;
        let session = Session::new(cfg).unwrap();
        let final_model = session.paths().final_model();
        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout(_)));
        let saved = Head::load_checkpoint(&final_model).unwrap();
        assert_eq!(saved.kind(), "lda");
        assert_eq!(saved.dim(), 10);
    }

    #[tokio::test]
    async fn live_session_adapts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let stream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = base_config(dir.path()).await;
        cfg.handshake_timeout_ms = 5_000;
        cfg.context_timeout_ms = 100;
        cfg.sensor = SensorConfig {
            source: SensorSource::Tcp {
                addr: stream.local_addr().unwrap().to_string(),
            },
            channels: 2,
            window_size: 10,
            window_increment: 10,
        };
        let handshake_addr = format!("127.0.0.1:{}", cfg.handshake_port);
        let context_addr = format!("127.0.0.1:{}", cfg.context_port);

        let session = Session::new(cfg).unwrap();
        let paths = session.paths().clone();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(session.run(shutdown.clone()));

        let (mut sensor, _) = stream.accept().await.unwrap();
        for i in 0..30 {
            let v = if i % 2 == 0 { 1.0 } else { -1.0 };
            sensor
                .write_all(format!("[{v}, 0.5]\n").as_bytes())
                .await
                .unwrap();
        }

        let game = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 512];
        let mut reply = None;
        for _ in 0..50 {
            game.send_to(b"READY", &handshake_addr).await.unwrap();
            if let Ok(Ok((n, _))) =
                tokio::time::timeout(Duration::from_millis(100), game.recv_from(&mut buf)).await
            {
                reply = Some(String::from_utf8_lossy(&buf[..n]).to_string());
                break;
            }
        }
        assert_eq!(
            reply.as_deref(),
            Some(paths.session_dir().display().to_string().as_str())
        );

        let log = paths.preds_log();
        wait_for(|| {
            std::fs::read_to_string(&log)
                .map(|s| s.lines().count() == 3)
                .unwrap_or(false)
        })
        .await;

        game.send_to(b"1", &context_addr).await.unwrap();
        let snapshot = Memory::snapshot_path(&paths.memory_dir(), 0);
        wait_for(|| snapshot.exists()).await;

        // Closing the stream ends the session.
        drop(sensor);
        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.classifier.windows, 3);
        assert_eq!(summary.adaptation.fits, 1);
        assert_eq!(summary.generation, 1);

        let saved = CosineClassifier::load_checkpoint(&summary.final_model).unwrap();
        assert_eq!(saved.class_counts(), &[0, 3, 0]);
        assert_eq!(Memory::load_all(&paths.memory_dir()).unwrap().len(), 3);
        assert!(!shutdown.is_cancelled());
    }
}
