/// Fall replay example: feed a recorded fall through the detection pipeline
use sentinel_safety::fall_detection::FallState;
use sentinel_safety::sim::fall_trace;
use sentinel_safety::{DetectionConfig, DetectionEvent, DetectionPipeline};

fn main() {
    println!("=== Sentinel: Fall Replay ===\n");

    // 50Hz, default thresholds (free fall < 2 m/s², landing > 25 m/s²)
    let config = DetectionConfig::default();
    let mut pipeline = DetectionPipeline::new(config);

    // 1s resting, 200ms free fall, tumbling impact, 2s resting
    let samples = fall_trace(0, 20);
    println!("Processing {} samples...\n", samples.len());

    let mut previous_state = FallState::Idle;
    for sample in &samples {
        let output = pipeline.process_sample(sample);

        let state = pipeline.fall_state();
        if state != previous_state {
            if let Some(snapshot) = output.snapshot {
                println!(
                    "{:>5}ms  {:?} -> {:?}  (|a| = {:.2} m/s², baseline {:.2})",
                    sample.timestamp_ms,
                    previous_state,
                    state,
                    snapshot.magnitude,
                    snapshot.baseline
                );
            }
            previous_state = state;
        }

        for event in output.events {
            print_event(&event);
        }
    }

    // Close any window still waiting for its deadline
    if let Some(event) = pipeline.poll(u64::MAX) {
        print_event(&event);
    }

    println!("\n=== Summary ===");
    println!("Samples processed: {}", pipeline.total_samples());
    println!("Detections:        {}", pipeline.total_events());
    println!("Final baseline:    {:.2} m/s²", pipeline.baseline());

    let recent = pipeline.display_magnitudes();
    let peak = recent.iter().copied().fold(0.0f32, f32::max);
    println!(
        "Display buffer:    {} values, peak {:.2} m/s²",
        recent.len(),
        peak
    );
}

fn print_event(event: &DetectionEvent) {
    println!(
        "{:>5}ms  ** {} ({:?} severity) **",
        event.timestamp_ms(),
        event.alert_type(),
        event.alert_type().default_severity()
    );
}
