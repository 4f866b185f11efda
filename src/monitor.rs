//! Async motion monitoring.
//!
//! `MotionMonitor` subscribes to the platform sensor stream and drives a
//! `DetectionPipeline` from a spawned task. Samples arrive over a channel;
//! free-fall windows that expire while no sample arrives are closed by a timer
//! aligned to the sample clock. Detections and display snapshots are
//! broadcast, and the task's health is published on a watch channel.
//!
//! A failed or ended sensor stream stops the task and sets
//! `MonitorStatus::SensorUnavailable`. Nothing on the response side can stop
//! it: responders only ever read from the broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::capabilities::{CapabilityError, SensorStream};
use crate::error::{SentinelError, SentinelResult};
use crate::pipeline::{DetectionConfig, DetectionPipeline};
use crate::types::{DetectionEvent, SensorSnapshot};

/// A detection plus the snapshot current when it fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub event: DetectionEvent,
    pub snapshot: Option<SensorSnapshot>,
}

/// Health of the monitoring task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorStatus {
    Idle,
    Running,
    Stopped,
    PermissionUnavailable(String),
    SensorUnavailable(String),
}

/// Counters returned when the monitoring task ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub samples_processed: u64,
    pub detections: u64,
}

/// Sensor-driven detection service.
pub struct MotionMonitor {
    config: DetectionConfig,
    sensors: Arc<dyn SensorStream>,
    detections: broadcast::Sender<Detection>,
    snapshots: broadcast::Sender<SensorSnapshot>,
    status: watch::Sender<MonitorStatus>,
}

impl MotionMonitor {
    pub fn new(config: DetectionConfig, sensors: Arc<dyn SensorStream>) -> Self {
        let (detections, _) = broadcast::channel(64);
        let (snapshots, _) = broadcast::channel(256);
        let (status, _) = watch::channel(MonitorStatus::Idle);
        Self {
            config,
            sensors,
            detections,
            snapshots,
            status,
        }
    }

    pub fn subscribe_detections(&self) -> broadcast::Receiver<Detection> {
        self.detections.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<SensorSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<MonitorStatus> {
        self.status.subscribe()
    }

    /// Subscribe to the sensors and start the monitoring task.
    ///
    /// Fails when the stream refuses the subscription. Dropping the returned
    /// handle stops the task.
    pub async fn start(&self) -> SentinelResult<MonitorHandle> {
        let period = Duration::from_millis(self.config.sample_period_ms.max(1));
        let samples = match self.sensors.subscribe(period).await {
            Ok(rx) => rx,
            Err(e) => {
                let status = unavailable_status(&e);
                log::error!("sensor subscription failed: {e}");
                self.status.send_replace(status);
                return Err(e.into());
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = Worker {
            pipeline: DetectionPipeline::new(self.config.clone()),
            detections: self.detections.clone(),
            snapshots: self.snapshots.clone(),
            status: self.status.clone(),
        };
        self.status.send_replace(MonitorStatus::Running);
        log::info!("motion monitoring started ({}ms period)", period.as_millis());
        let task = tokio::spawn(worker.run(samples, stop_rx));
        Ok(MonitorHandle {
            stop: Some(stop_tx),
            task,
        })
    }
}

fn unavailable_status(err: &CapabilityError) -> MonitorStatus {
    match err {
        CapabilityError::PermissionDenied(what) => {
            MonitorStatus::PermissionUnavailable(what.clone())
        }
        other => MonitorStatus::SensorUnavailable(other.to_string()),
    }
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<MonitorSummary>,
}

impl MonitorHandle {
    /// Stop monitoring and wait for the task.
    pub async fn stop(mut self) -> SentinelResult<MonitorSummary> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join().await
    }

    /// Wait for the task to end on its own (stream closed or failed).
    pub async fn join(self) -> SentinelResult<MonitorSummary> {
        let MonitorHandle { stop, task } = self;
        let summary = task
            .await
            .map_err(|e| SentinelError::SensorUnavailable(format!("monitor task: {e}")));
        drop(stop);
        summary
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Worker {
    pipeline: DetectionPipeline,
    detections: broadcast::Sender<Detection>,
    snapshots: broadcast::Sender<SensorSnapshot>,
    status: watch::Sender<MonitorStatus>,
}

impl Worker {
    async fn run(
        mut self,
        mut samples: crate::capabilities::SampleReceiver,
        mut stop: oneshot::Receiver<()>,
    ) -> MonitorSummary {
        // Sample clock anchored to the runtime clock at the first sample.
        let mut anchor: Option<(u64, Instant)> = None;
        let mut last_snapshot: Option<SensorSnapshot> = None;

        let final_status = loop {
            let deadline = match (self.pipeline.next_deadline_ms(), anchor) {
                (Some(deadline_ms), Some((origin_ms, origin))) => {
                    Some(origin + Duration::from_millis(deadline_ms.saturating_sub(origin_ms)))
                }
                _ => None,
            };

            tokio::select! {
                biased;
                _ = &mut stop => break MonitorStatus::Stopped,
                message = samples.recv() => match message {
                    Some(Ok(sample)) => {
                        if anchor.is_none() {
                            anchor = Some((sample.timestamp_ms, Instant::now()));
                        }
                        let output = self.pipeline.process_sample(&sample);
                        if let Some(snapshot) = output.snapshot {
                            last_snapshot = Some(snapshot);
                            let _ = self.snapshots.send(snapshot);
                        }
                        for event in output.events {
                            self.publish(event, last_snapshot);
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("sensor stream failed: {e}");
                        break unavailable_status(&e);
                    }
                    None => {
                        log::warn!("sensor stream ended");
                        break MonitorStatus::SensorUnavailable("sensor stream ended".into());
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    if let Some((origin_ms, origin)) = anchor {
                        let now_ms = origin_ms.saturating_add(origin.elapsed().as_millis() as u64);
                        if let Some(event) = self.pipeline.poll(now_ms) {
                            self.publish(event, last_snapshot);
                        }
                    }
                }
            }
        };

        log::info!(
            "motion monitoring ended after {} samples: {final_status:?}",
            self.pipeline.total_samples()
        );
        self.status.send_replace(final_status);
        MonitorSummary {
            samples_processed: self.pipeline.total_samples(),
            detections: self.pipeline.total_events(),
        }
    }

    fn publish(&self, event: DetectionEvent, snapshot: Option<SensorSnapshot>) {
        log::info!("detected {event:?}");
        if self.detections.send(Detection { event, snapshot }).is_err() {
            log::debug!("no detection subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{fall_trace, resting_trace, ReplaySensorStream};
    use crate::types::SensorSample;

    #[tokio::test(start_paused = true)]
    async fn test_detects_fall_from_replayed_trace() {
        let stream = Arc::new(ReplaySensorStream::new(fall_trace(0, 20)));
        let monitor = MotionMonitor::new(DetectionConfig::default(), stream);
        let mut detections = monitor.subscribe_detections();

        let handle = monitor.start().await.unwrap();
        let summary = handle.join().await.unwrap();
        assert_eq!(summary.samples_processed, 163);

        let mut falls = 0;
        while let Ok(detection) = detections.try_recv() {
            if matches!(detection.event, DetectionEvent::Fall { .. }) {
                falls += 1;
                assert!(detection.snapshot.is_some());
            }
        }
        assert_eq!(falls, 1);
        assert_eq!(
            *monitor.status().borrow(),
            MonitorStatus::SensorUnavailable("sensor stream ended".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_closes_window_without_samples() {
        // Free fall, spike, then the stream goes quiet but stays open.
        let mut trace = resting_trace(0, 20, 20);
        trace.push(SensorSample::new(400, [0.1, 0.1, 0.1], [0.0; 3]));
        trace.push(SensorSample::new(420, [0.0, 0.0, 30.0], [0.0; 3]));
        let stream = Arc::new(ReplaySensorStream::new(trace).held_open());
        let monitor = MotionMonitor::new(DetectionConfig::default(), stream);
        let mut detections = monitor.subscribe_detections();

        let handle = monitor.start().await.unwrap();
        let detection = tokio::time::timeout(Duration::from_secs(5), detections.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(detection.event, DetectionEvent::Fall { .. }));
        assert!(!handle.is_finished());

        let summary = handle.stop().await.unwrap();
        assert_eq!(summary.samples_processed, 22);
        assert_eq!(summary.detections, 1);
        assert_eq!(*monitor.status().borrow(), MonitorStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resting_device_emits_snapshots_only() {
        let stream = Arc::new(ReplaySensorStream::new(resting_trace(0, 20, 50)));
        let monitor = MotionMonitor::new(DetectionConfig::default(), stream);
        let mut detections = monitor.subscribe_detections();
        let mut snapshots = monitor.subscribe_snapshots();

        monitor.start().await.unwrap().join().await.unwrap();
        assert!(detections.try_recv().is_err());
        let mut count = 0;
        while snapshots.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_reports_unavailable() {
        let stream = Arc::new(
            ReplaySensorStream::new(resting_trace(0, 20, 3))
                .with_terminal_error(CapabilityError::Failed("driver reset".into())),
        );
        let monitor = MotionMonitor::new(DetectionConfig::default(), stream);
        monitor.start().await.unwrap().join().await.unwrap();
        assert!(matches!(
            *monitor.status().borrow(),
            MonitorStatus::SensorUnavailable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_subscription() {
        let stream = Arc::new(ReplaySensorStream::failing(CapabilityError::PermissionDenied(
            "motion".into(),
        )));
        let monitor = MotionMonitor::new(DetectionConfig::default(), stream);
        let err = monitor.start().await.err().unwrap();
        assert!(matches!(err, SentinelError::PermissionUnavailable(_)));
        assert_eq!(
            *monitor.status().borrow(),
            MonitorStatus::PermissionUnavailable("motion".into())
        );
    }
}
