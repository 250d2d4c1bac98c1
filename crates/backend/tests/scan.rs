//! End-to-end scan runs on the host device.

use itertools::Itertools;
use parascan_backend::{
    buffers::level_count,
    scan::{ScanPass, SCAN_ADD_KERNEL},
    validator::{reference_inclusive_scan, Verdict},
    ComputeTask, HostDevice, PipelineError, ScanPipeline, ScanStrategy,
};
use parascan_sdk::utils::{create_seeded_rng, create_seeded_rng_with_seed, setup_tracing};
use rand::Rng;
use strum::IntoEnumIterator;
use test_case::test_case;

fn scan_all(input: Vec<u32>, min_block_size: usize, local: usize) -> Vec<Vec<u32>> {
    let mut pipeline = ScanPipeline::from_input(HostDevice::default(), input, min_block_size).unwrap();
    pipeline.init_resources().unwrap();
    ScanStrategy::iter()
        .map(|s| pipeline.run(s, local).unwrap().to_vec())
        .collect()
}

#[test]
fn test_all_ones() {
    setup_tracing();
    let expected = (1..=16).collect_vec();
    for result in scan_all(vec![1; 16], 8, 4) {
        assert_eq!(result, expected);
    }
    for result in scan_all(vec![1; 16], 2, 256) {
        assert_eq!(result, expected);
    }
}

#[test]
fn test_single_element() {
    let mut pipeline = ScanPipeline::from_input(HostDevice::default(), vec![11], 8).unwrap();
    assert_eq!(pipeline.hierarchy().levels(), 2);
    assert!(pipeline
        .plan_passes(ScanStrategy::NaiveDoubling, 8)
        .unwrap()
        .is_empty());
    let passes = pipeline.plan_passes(ScanStrategy::WorkEfficient, 8).unwrap();
    assert!(passes
        .iter()
        .all(|p| !matches!(p, ScanPass::DownSweep { .. })));
    pipeline.init_resources().unwrap();
    for strategy in ScanStrategy::iter() {
        assert_eq!(pipeline.run(strategy, 8).unwrap(), &[11]);
    }
}

#[test_case(17, 8, 4 ; "when n spills one element past a block")]
#[test_case(1 << 12, 8, 64)]
#[test_case(1 << 12, 256, 256 ; "when n equals one standard block")]
#[test_case(5000, 3, 7 ; "when block and group sizes are odd")]
#[test_case(100_003, 16, 128 ; "when the hierarchy is four levels deep")]
#[test_case(2, 1, 1 ; "when blocks hold two elements")]
fn test_strategies_agree_with_reference(n: usize, m: usize, local: usize) {
    setup_tracing();
    let mut rng = create_seeded_rng();
    let mut pipeline = ScanPipeline::new(HostDevice::default(), n, m, &mut rng).unwrap();
    let expected = reference_inclusive_scan(pipeline.input());
    pipeline.init_resources().unwrap();
    for strategy in ScanStrategy::iter() {
        assert_eq!(pipeline.run(strategy, local).unwrap(), expected.as_slice(), "{strategy}");
    }
}

#[test]
fn test_random_sizes() {
    let mut rng = create_seeded_rng_with_seed(3);
    for _ in 0..16 {
        let n = rng.random_range(1..20_000usize);
        let m = 1usize << rng.random_range(0..7);
        let local = rng.random_range(1..300);
        let input = (0..n).map(|_| rng.random()).collect_vec();
        let expected = reference_inclusive_scan(&input);
        for result in scan_all(input, m, local) {
            assert_eq!(result, expected, "n = {n}, m = {m}, local = {local}");
        }
    }
}

#[test]
fn test_wraparound() {
    let input = vec![u32::MAX; 40];
    let expected = reference_inclusive_scan(&input);
    assert_eq!(expected[1], u32::MAX - 1);
    for result in scan_all(input, 4, 8) {
        assert_eq!(result, expected);
    }
}

#[test]
fn test_level_count_properties() {
    for m in [1, 4, 256] {
        let levels = (1..10_000).map(|n| level_count(n, m)).collect_vec();
        assert!(levels.iter().tuple_windows().all(|(a, b)| a <= b));
        assert!(levels[..2 * m].iter().all(|&l| l == 2));
    }
}

#[test]
fn test_up_and_down_sweep_dispatches() {
    let device = HostDevice::default();
    let mut pipeline = ScanPipeline::from_input(device.clone(), vec![1; 17], 8).unwrap();
    assert_eq!(pipeline.hierarchy().counts(), &[17, 2, 1]);
    let up = pipeline.plan_up_sweep();
    assert_eq!(
        up.iter().map(|c| (c.global, c.local, c.groups)).collect_vec(),
        vec![(16, 8, 2), (1, 1, 1)]
    );
    pipeline.init_resources().unwrap();
    device.clear_dispatch_log();
    pipeline.run(ScanStrategy::WorkEfficient, 8).unwrap();
    let log = device.dispatch_log();
    assert_eq!(
        log.iter().map(|r| r.kernel).collect_vec(),
        vec!["scanWorkEfficient", "scanWorkEfficient", SCAN_ADD_KERNEL]
    );
    let add = log[2].config;
    assert_eq!((add.global, add.local, add.groups), (24, 8, 3));
    assert!(add.global >= pipeline.hierarchy().count(0));
    assert_eq!(pipeline.gpu_result(ScanStrategy::WorkEfficient).unwrap()[16], 17);
}

#[test]
fn test_down_sweep_dispatches_cover_every_element() {
    let device = HostDevice::default();
    let n = 1 << 12;
    let mut pipeline = ScanPipeline::from_input(device.clone(), vec![1; n], 8).unwrap();
    assert_eq!(pipeline.hierarchy().counts(), &[4096, 256, 16, 1]);
    pipeline.init_resources().unwrap();
    device.clear_dispatch_log();
    let result = pipeline.run(ScanStrategy::WorkEfficient, 8).unwrap().to_vec();
    let adds = device
        .dispatch_log()
        .into_iter()
        .filter(|r| r.kernel == SCAN_ADD_KERNEL)
        .map(|r| (r.config.global, r.config.local, r.config.groups))
        .collect_vec();
    assert_eq!(adds, vec![(256, 8, 32), (n, 8, 512)]);
    assert_eq!(result, (1..=n as u32).collect_vec());
}

#[test]
fn test_naive_passes_collapse_to_one_group() {
    let pipeline = ScanPipeline::from_input(HostDevice::default(), vec![1; 100], 8).unwrap();
    let passes = pipeline.plan_passes(ScanStrategy::NaiveDoubling, 256).unwrap();
    assert_eq!(passes.len(), 7);
    for pass in passes {
        let config = pass.config();
        assert_eq!((config.global, config.local, config.groups), (100, 100, 1));
    }
}

#[test]
fn test_validation_report() {
    let mut pipeline = ScanPipeline::from_input(HostDevice::default(), vec![2; 300], 4).unwrap();
    pipeline.init_resources().unwrap();
    pipeline.compute_cpu();
    pipeline.compute_gpu(32).unwrap();
    assert!(pipeline.validate_results());
    let report = pipeline.validation_report();
    assert_eq!(report.records.len(), 2);
    assert!(report.records.iter().all(|r| r.verdict == Verdict::Passed));
    assert_eq!(pipeline.cpu_result().unwrap()[299], 600);
}

#[test]
fn test_lifecycle_errors() {
    let device = HostDevice::default();
    assert_eq!(
        ScanPipeline::from_input(device.clone(), vec![], 8).err(),
        Some(PipelineError::EmptyProblem)
    );
    assert_eq!(
        ScanPipeline::from_input(device.clone(), vec![1], 0).err(),
        Some(PipelineError::InvalidBlockSize)
    );

    let mut pipeline = ScanPipeline::from_input(device.clone(), vec![1; 1000], 8).unwrap();
    assert_eq!(
        pipeline.run(ScanStrategy::WorkEfficient, 8).err(),
        Some(PipelineError::ResourcesNotInitialized)
    );
    pipeline.init_resources().unwrap();
    assert!(device.allocated_bytes() > 0);
    pipeline.release_resources();
    pipeline.release_resources();
    assert_eq!(device.allocated_bytes(), 0);
    pipeline.init_resources().unwrap();
    assert_eq!(
        pipeline.run(ScanStrategy::NaiveDoubling, 16).unwrap()[999],
        1000
    );
}
