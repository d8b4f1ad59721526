//! Load orchestration against the simulated platform
//!
//! Every test binds a tile, loads through `Accelerator::load` and checks
//! what was staged, what the MC saw, and that the platform is back to the
//! post-init baseline afterwards.

use aiop_driver::sim::{Fault, RemoteCall, SimEvent, SimPlatform};
use aiop_driver::{Accelerator, AiopError, ContainerName, Iova, LoadRequest, ResourcePool};
use aiop_mc::dpaiop::RUN_CORES_ALL;
use aiop_mc::layout::{IRQ_WINDOW_IOVA, IRQ_WINDOW_LEN};
use aiop_mc::{McStatus, TileState};
use std::io::Write;
use tempfile::NamedTempFile;

fn file_of(len: usize) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(&vec![0x5A; len]).unwrap();
    f.flush().unwrap();
    f
}

fn bound() -> (SimPlatform, Accelerator<SimPlatform>) {
    let sim = SimPlatform::builder()
        .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0"])
        .build();
    let acc =
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default()).unwrap();
    sim.clear_calls();
    (sim, acc)
}

/// IOVAs of buffer registrations, interrupt window excluded.
fn buffer_iovas(events: &[SimEvent]) -> Vec<(Iova, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            SimEvent::MapDma { iova, len } if iova.0 != IRQ_WINDOW_IOVA => Some((*iova, *len)),
            _ => None,
        })
        .collect()
}

#[test]
fn single_page_image_is_staged_loaded_and_run() {
    let (sim, mut acc) = bound();
    let baseline = sim.held();
    let image = file_of(4096);

    acc.load(&LoadRequest::new(image.path())).unwrap();

    let events = sim.events();
    let opened = events
        .iter()
        .filter(|e| matches!(e, SimEvent::OpenFile(_)))
        .count();
    assert_eq!(opened, 1);
    let mapped: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SimEvent::MapFile { len } => Some(*len),
            _ => None,
        })
        .collect();
    assert_eq!(mapped, vec![8192]);

    let dma = buffer_iovas(&events);
    assert_eq!(dma.len(), 1);
    assert_eq!(dma[0].1, 8192);

    assert_eq!(
        sim.remote_calls(),
        vec![
            RemoteCall::Open(0),
            RemoteCall::Load {
                iova: dma[0].0 .0,
                size: 4096
            },
            RemoteCall::Run {
                cores_mask: RUN_CORES_ALL,
                args_iova: 0,
                args_size: 0
            },
            RemoteCall::Close,
        ]
    );
    assert_eq!(sim.firmware().state, TileState::Running);
    assert_eq!(sim.held(), baseline);
}

#[test]
fn arguments_are_passed_to_run() {
    let (sim, mut acc) = bound();
    let image = file_of(5000);
    let args = file_of(100);

    acc.load(&LoadRequest::new(image.path()).with_args(args.path()))
        .unwrap();

    let dma = buffer_iovas(&sim.events());
    assert_eq!(dma.len(), 2);
    assert_eq!(dma[0].1, 8192);
    assert_eq!(dma[1].1, 4096);
    assert!(sim.remote_calls().contains(&RemoteCall::Run {
        cores_mask: RUN_CORES_ALL,
        args_iova: dma[1].0 .0,
        args_size: 100,
    }));
}

#[test]
fn oversized_arguments_are_rejected_before_staging() {
    let (sim, mut acc) = bound();
    let baseline = sim.held();
    let image = file_of(4096);
    let args = file_of(600);

    let err = acc
        .load(&LoadRequest::new(image.path()).with_args(args.path()))
        .unwrap_err();
    assert!(err.is_validation());
    assert!(sim.events().is_empty());
    assert_eq!(sim.held(), baseline);
}

#[test]
fn unreadable_arguments_are_rejected_before_staging() {
    use std::os::unix::fs::PermissionsExt;

    let (sim, mut acc) = bound();
    let baseline = sim.held();
    let image = file_of(4096);
    let args = file_of(64);
    std::fs::set_permissions(args.path(), std::fs::Permissions::from_mode(0o000)).unwrap();
    if std::fs::File::open(args.path()).is_ok() {
        // Permission bits do not apply to privileged callers.
        return;
    }

    let err = acc
        .load(&LoadRequest::new(image.path()).with_args(args.path()))
        .unwrap_err();
    assert!(err.is_validation());
    assert!(sim.events().is_empty());
    assert_eq!(sim.held(), baseline);
}

#[test]
fn size_limits_are_inclusive() {
    let (sim, mut acc) = bound();
    let max = file_of(8 * 1024 * 1024);
    acc.load(&LoadRequest::new(max.path())).unwrap();
    assert!(sim
        .events()
        .contains(&SimEvent::MapFile {
            len: 8 * 1024 * 1024 + 4096
        }));

    let over = file_of(8 * 1024 * 1024 + 1);
    assert!(acc
        .load(&LoadRequest::new(over.path()))
        .unwrap_err()
        .is_validation());

    let image = file_of(64);
    let args = file_of(512);
    acc.load(&LoadRequest::new(image.path()).with_args(args.path()))
        .unwrap();
    let args = file_of(513);
    assert!(acc
        .load(&LoadRequest::new(image.path()).with_args(args.path()))
        .unwrap_err()
        .is_validation());
}

#[test]
fn reset_runs_before_load_when_requested() {
    let (sim, mut acc) = bound();
    let image = file_of(4096);
    acc.load(&LoadRequest::new(image.path()).with_reset(true))
        .unwrap();
    let calls = sim.remote_calls();
    assert_eq!(calls[1], RemoteCall::Reset);
    assert!(matches!(calls[2], RemoteCall::Load { .. }));
    assert!(matches!(calls[3], RemoteCall::Run { .. }));
}

#[test]
fn failed_reset_does_not_fail_the_load() {
    let (sim, mut acc) = bound();
    let baseline = sim.held();
    sim.inject(Fault::Reset);
    let image = file_of(4096);

    acc.load(&LoadRequest::new(image.path()).with_reset(true))
        .unwrap();

    let calls = sim.remote_calls();
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[1], RemoteCall::Reset);
    assert!(matches!(calls[2], RemoteCall::Load { .. }));
    assert!(matches!(calls[3], RemoteCall::Run { .. }));
    assert_eq!(sim.firmware().state, TileState::Running);
    assert_eq!(sim.held(), baseline);
}

#[test]
fn every_failure_point_unwinds_completely() {
    let faults = [
        Fault::OpenFile(1),
        Fault::OpenFile(2),
        Fault::MapFile(1),
        Fault::MapFile(2),
        Fault::MapDma(1),
        Fault::MapDma(2),
        Fault::FirmwareOpen,
        Fault::Load,
        Fault::Run,
        Fault::FirmwareClose,
    ];
    for fault in faults {
        let (sim, mut acc) = bound();
        let baseline = sim.held();
        let image = file_of(4096);
        let args = file_of(256);
        sim.inject(fault);

        let res = acc.load(&LoadRequest::new(image.path()).with_args(args.path()));
        assert!(res.is_err(), "{fault:?}");
        assert_eq!(sim.held(), baseline, "{fault:?}");

        sim.clear_faults();
        acc.teardown().unwrap();
        assert!(sim.held().is_empty(), "{fault:?}");
    }
}

#[test]
fn interrupt_window_failure_is_not_fatal() {
    let (sim, mut acc) = bound();
    let baseline = sim.held();
    sim.inject(Fault::MapIrqWindow);
    let image = file_of(4096);
    acc.load(&LoadRequest::new(image.path())).unwrap();
    assert_eq!(sim.held(), baseline);
}

#[test]
fn unwind_runs_in_reverse_order() {
    let (sim, mut acc) = bound();
    sim.inject(Fault::Run);
    let image = file_of(4096);
    let args = file_of(256);

    acc.load(&LoadRequest::new(image.path()).with_args(args.path()))
        .unwrap_err();

    let events = sim.events();
    let dma = buffer_iovas(&events);
    let (image_iova, args_iova) = (dma[0].0, dma[1].0);
    let close_at = events
        .iter()
        .position(|e| *e == SimEvent::Remote(RemoteCall::Close))
        .unwrap();
    assert_eq!(
        events[close_at + 1..].to_vec(),
        vec![
            SimEvent::UnmapDma {
                iova: args_iova,
                len: 4096
            },
            SimEvent::UnmapDma {
                iova: Iova(IRQ_WINDOW_IOVA),
                len: IRQ_WINDOW_LEN
            },
            SimEvent::Unmap {
                len: IRQ_WINDOW_LEN
            },
            SimEvent::UnmapDma {
                iova: image_iova,
                len: 8192
            },
            SimEvent::Unmap { len: 4096 },
            SimEvent::Close("file"),
            SimEvent::Unmap { len: 8192 },
            SimEvent::Close("file"),
        ]
    );
}

#[test]
fn load_error_wins_over_close_error() {
    let (sim, mut acc) = bound();
    sim.inject(Fault::Load);
    sim.inject(Fault::FirmwareClose);
    let image = file_of(4096);
    let err = acc.load(&LoadRequest::new(image.path())).unwrap_err();
    assert!(matches!(
        err,
        AiopError::Firmware {
            op: "load",
            status: McStatus::ConfigError
        }
    ));
    // Run is never issued after a failed load.
    assert!(!sim
        .remote_calls()
        .iter()
        .any(|c| matches!(c, RemoteCall::Run { .. })));
}
