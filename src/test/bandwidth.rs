use crate::device::Dtype;
use crate::report::{MeasuredTimes, derive_report};

fn times(elapsed: f64, computation: f64) -> MeasuredTimes {
    MeasuredTimes {
        elapsed_seconds: elapsed,
        computation_seconds: computation,
    }
}

#[test]
fn communication_time_is_never_negative() {
    let pairs = [
        (0.010, 0.002),
        (0.002, 0.010),
        (0.0, 0.0),
        (1.0, 1.0),
        (0.5, 0.0),
    ];
    for (elapsed, computation) in pairs {
        let report = derive_report(times(elapsed, computation), 1000, Dtype::F32, 4, 10, 10);
        assert!(
            report.communication_seconds >= 0.0,
            "elapsed={elapsed} computation={computation}"
        );
        assert_eq!(
            report.communication_seconds,
            (elapsed - computation).max(0.0)
        );
    }
}

#[test]
fn single_rank_moves_no_data_and_reports_unbounded() {
    let report = derive_report(times(0.010, 0.002), 1_000_000, Dtype::Bf16, 1, 10, 10);
    assert_eq!(report.total_megabytes, 0.0);
    assert!(report.bandwidth_mbps.is_none());
}

#[test]
fn total_data_scales_linearly_with_peer_count() {
    let small = derive_report(times(0.010, 0.002), 1_000_000, Dtype::Bf16, 3, 10, 10);
    let large = derive_report(times(0.010, 0.002), 1_000_000, Dtype::Bf16, 5, 10, 10);
    // (5 - 1) is twice (3 - 1), so total data and bandwidth double.
    assert_eq!(large.total_megabytes, small.total_megabytes * 2.0);
    let small_bw = small.bandwidth_mbps.unwrap();
    let large_bw = large.bandwidth_mbps.unwrap();
    assert!((large_bw - small_bw * 2.0).abs() < 1e-9);
}

#[test]
fn four_rank_scenario_matches_expected_numbers() {
    // 1,000,000 elements x 2 bytes across 4 ranks, 10 ms elapsed of which
    // 2 ms is computation.
    let report = derive_report(times(0.010, 0.002), 1_000_000, Dtype::Bf16, 4, 10, 10);
    assert!((report.communication_seconds - 0.008).abs() < 1e-12);
    assert!((report.total_megabytes - 11.444091796875).abs() < 1e-9);
    let bandwidth = report.bandwidth_mbps.unwrap();
    assert!(
        (bandwidth - 1430.511474609375).abs() < 1e-6,
        "bandwidth={bandwidth}"
    );
}

#[test]
fn noisy_measurement_clamps_and_reports_unbounded() {
    let report = derive_report(times(0.002, 0.010), 1_000_000, Dtype::Bf16, 4, 10, 10);
    assert_eq!(report.communication_seconds, 0.0);
    assert!(report.bandwidth_mbps.is_none());
    assert!(report.total_megabytes > 0.0);
}

#[test]
fn dtype_width_feeds_the_data_model() {
    let narrow = derive_report(times(0.010, 0.002), 1_000_000, Dtype::F16, 2, 10, 10);
    let wide = derive_report(times(0.010, 0.002), 1_000_000, Dtype::F32, 2, 10, 10);
    assert_eq!(wide.total_megabytes, narrow.total_megabytes * 2.0);
}
