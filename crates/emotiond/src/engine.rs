use emotion_core::frame::FrameError;
use emotion_core::{DetectedFace, ExpressionModel, GrayFrame, PipelineError};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] FrameError),
    #[error("inference failed: {0}")]
    Inference(#[from] PipelineError),
    #[error("all inference workers are busy")]
    Busy,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A unit of work: encoded image bytes and where to send the faces.
struct AnalyzeRequest {
    image: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<DetectedFace>, EngineError>>,
}

/// Clone-safe handle to the engine worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<AnalyzeRequest>,
    workers: usize,
}

impl EngineHandle {
    /// Decode `image` and run face/expression inference on a worker thread.
    ///
    /// Fails with [`EngineError::Busy`] instead of waiting when the queue is full.
    pub async fn analyze(&self, image: Vec<u8>) -> Result<Vec<DetectedFace>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(AnalyzeRequest {
                image,
                reply: reply_tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => EngineError::Busy,
                TrySendError::Closed(_) => EngineError::ChannelClosed,
            })?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Requests waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Spawn `workers` engine threads sharing one bounded request queue.
///
/// `load` is called once per worker, on the calling thread, before any
/// thread starts: a model that fails to load aborts startup.
pub fn spawn_engine<M, F, E>(
    workers: usize,
    queue_depth: usize,
    mut load: F,
) -> Result<EngineHandle, E>
where
    M: ExpressionModel + 'static,
    F: FnMut() -> Result<M, E>,
    E: From<EngineError>,
{
    let workers = workers.max(1);
    let models = (0..workers).map(|_| load()).collect::<Result<Vec<M>, E>>()?;
    tracing::info!(workers, queue_depth, "inference models loaded");

    let (tx, rx) = mpsc::channel::<AnalyzeRequest>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    for (id, mut model) in models.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("emotion-engine-{id}"))
            .spawn(move || {
                tracing::debug!(worker = id, "engine thread started");
                while let Some(req) = next_request(&rx) {
                    if req.reply.is_closed() {
                        tracing::debug!(worker = id, "requester gone, skipping analyze");
                        continue;
                    }
                    let result = run_analyze(&mut model, &req.image);
                    if let Err(e) = &result {
                        tracing::debug!(worker = id, error = %e, "analyze failed");
                    }
                    // requester may have timed out
                    let _ = req.reply.send(result);
                }
                tracing::debug!(worker = id, "engine thread exiting");
            })
            .map_err(|e| E::from(EngineError::Spawn(e)))?;
    }

    Ok(EngineHandle { tx, workers })
}

/// Take the next request; `None` once every sender is gone.
fn next_request(rx: &Mutex<mpsc::Receiver<AnalyzeRequest>>) -> Option<AnalyzeRequest> {
    let mut rx = match rx.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    rx.blocking_recv()
}

fn run_analyze<M: ExpressionModel>(
    model: &mut M,
    image: &[u8],
) -> Result<Vec<DetectedFace>, EngineError> {
    let started = Instant::now();
    let frame = GrayFrame::decode(image)?;
    let faces = model.analyze(&frame)?;
    tracing::debug!(
        width = frame.width,
        height = frame.height,
        brightness = frame.avg_brightness(),
        faces = faces.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "analyze complete"
    );
    Ok(faces)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use emotion_core::{BoundingBox, EmotionLabel, ExpressionScores};
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    /// Returns the configured faces for every frame.
    pub(crate) struct FixedModel {
        pub faces: Vec<DetectedFace>,
    }

    impl ExpressionModel for FixedModel {
        fn analyze(&mut self, _frame: &GrayFrame) -> Result<Vec<DetectedFace>, PipelineError> {
            Ok(self.faces.clone())
        }
    }

    /// Signals when an analyze call starts, then blocks until the test opens the gate.
    struct GatedModel {
        gate: Arc<Mutex<std_mpsc::Receiver<()>>>,
        started: mpsc::UnboundedSender<()>,
        calls: Arc<AtomicUsize>,
    }

    impl ExpressionModel for GatedModel {
        fn analyze(&mut self, _frame: &GrayFrame) -> Result<Vec<DetectedFace>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(());
            let _ = self.gate.lock().unwrap().recv();
            Ok(Vec::new())
        }
    }

    /// Test side of a [`GatedModel`] engine.
    pub(crate) struct Gate {
        release: std_mpsc::Sender<()>,
        started: mpsc::UnboundedReceiver<()>,
        calls: Arc<AtomicUsize>,
    }

    impl Gate {
        /// Wait until a worker is inside the model.
        pub(crate) async fn wait_started(&mut self) {
            self.started.recv().await.unwrap();
        }

        /// Let `n` blocked or future analyze calls through.
        pub(crate) fn open(&self, n: usize) {
            for _ in 0..n {
                self.release.send(()).unwrap();
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn gated_engine(workers: usize, queue_depth: usize) -> (EngineHandle, Gate) {
        let (release, gate_rx) = std_mpsc::channel();
        let (started_tx, started) = mpsc::unbounded_channel();
        let gate_rx = Arc::new(Mutex::new(gate_rx));
        let calls = Arc::new(AtomicUsize::new(0));

        let engine = spawn_engine(workers, queue_depth, || {
            Ok::<_, EngineError>(GatedModel {
                gate: Arc::clone(&gate_rx),
                started: started_tx.clone(),
                calls: Arc::clone(&calls),
            })
        })
        .unwrap();
        (
            engine,
            Gate {
                release,
                started,
                calls,
            },
        )
    }

    /// Yield until `n` requests sit in the queue.
    pub(crate) async fn wait_queued(engine: &EngineHandle, n: usize) {
        while engine.queued() < n {
            tokio::task::yield_now().await;
        }
    }

    pub(crate) fn face(label: EmotionLabel, score: f32) -> DetectedFace {
        let mut values = [(1.0 - score) / 6.0; 7];
        values[EmotionLabel::ALL.iter().position(|l| *l == label).unwrap()] = score;
        DetectedFace {
            bbox: BoundingBox {
                x: 10.0,
                y: 10.0,
                width: 40.0,
                height: 40.0,
                confidence: 0.98,
                landmarks: None,
            },
            expressions: ExpressionScores::new(values),
        }
    }

    pub(crate) fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(16, 16, image::Rgb([120, 120, 120]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn fixed_engine(faces: Vec<DetectedFace>) -> EngineHandle {
        spawn_engine(1, 2, || Ok::<_, EngineError>(FixedModel { faces: faces.clone() })).unwrap()
    }

    #[tokio::test]
    async fn test_analyze_returns_faces() {
        let engine = fixed_engine(vec![face(EmotionLabel::Happy, 0.9)]);
        let faces = engine.analyze(png_bytes()).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].expressions.dominant().0, EmotionLabel::Happy);
    }

    #[tokio::test]
    async fn test_analyze_rejects_undecodable_bytes() {
        let engine = fixed_engine(vec![]);
        let err = engine.analyze(b"not an image".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_spawn_fails_when_model_fails_to_load() {
        let result = spawn_engine(2, 2, || Err::<FixedModel, _>(EngineError::ChannelClosed));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_loads_one_model_per_worker() {
        let mut loads = 0;
        let engine = spawn_engine(3, 1, || {
            loads += 1;
            Ok::<_, EngineError>(FixedModel { faces: vec![] })
        })
        .unwrap();
        assert_eq!(loads, 3);
        assert_eq!(engine.workers(), 3);
        assert_eq!(engine.queued(), 0);
    }

    #[tokio::test]
    async fn test_busy_when_queue_full() {
        let (engine, mut gate) = gated_engine(1, 1);

        // first request occupies the worker, second fills the queue
        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.analyze(png_bytes()).await }
        });
        gate.wait_started().await;
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.analyze(png_bytes()).await }
        });
        wait_queued(&engine, 1).await;

        let third = engine.analyze(png_bytes()).await;
        assert!(matches!(third, Err(EngineError::Busy)));

        gate.open(2);
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_request_is_skipped() {
        let (engine, mut gate) = gated_engine(1, 2);

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.analyze(png_bytes()).await }
        });
        gate.wait_started().await;

        // enqueued, then given up on by its caller
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), engine.analyze(png_bytes())).await;
        assert!(abandoned.is_err());

        let last = tokio::spawn({
            let engine = engine.clone();
            async move { engine.analyze(png_bytes()).await }
        });
        wait_queued(&engine, 2).await;

        // one spare release so a wrongly processed request cannot hang the test
        gate.open(3);
        assert!(first.await.unwrap().is_ok());
        assert!(last.await.unwrap().is_ok());
        assert_eq!(gate.calls(), 2);
    }
}
