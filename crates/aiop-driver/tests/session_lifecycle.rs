//! Session lifecycle: bind, operate, release

use aiop_driver::sim::{Fault, RemoteCall, SimFirmware, SimPlatform};
use aiop_driver::{
    Accelerator, AiopError, ContainerName, GroupId, Platform, PoolLimits, ResourcePool,
    VfioPlatform,
};
use aiop_mc::{SlVersion, TileAttributes, TileState};

fn platform() -> SimPlatform {
    SimPlatform::builder()
        .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0", "dpni.1"])
        .container("dprc.7", 9, &["dpaiop.1", "dpbp.3"])
        .build()
}

#[test]
fn bind_and_release_leaves_nothing_behind() {
    let sim = platform();
    let acc =
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default()).unwrap();
    assert_eq!(acc.devices().companion().name, "dpmcp.23");
    assert_eq!(acc.devices().accelerator().name, "dpaiop.0");
    assert_eq!(acc.pool().group_count(), 1);
    assert_eq!(sim.attached_groups(), 1);

    acc.teardown().unwrap();
    assert!(sim.held().is_empty());
    assert_eq!(sim.attached_groups(), 0);
}

#[test]
fn missing_companion_fails_bind_without_leaks() {
    let sim = platform();
    let name = ContainerName::new("dprc.7").unwrap();
    let err = Accelerator::init(sim.clone(), ResourcePool::default(), &name).unwrap_err();
    assert!(matches!(
        err,
        AiopError::DeviceMissing {
            role: "dpmcp",
            group: 9
        }
    ));
    assert!(sim.held().is_empty());
    assert_eq!(sim.attached_groups(), 0);
    assert!(sim.remote_calls().is_empty());
}

#[test]
fn group_is_acquired_once() {
    let sim = platform();
    let mut pool = ResourcePool::new(PoolLimits::default());
    let first = pool.acquire(&sim, GroupId(7)).unwrap();
    let fds = sim.held().fds;
    let second = pool.acquire(&sim, GroupId(7)).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.group_fd(), second.group_fd());
    assert_eq!(sim.held().fds, fds);
    pool.release(&sim, first).unwrap();
    assert!(sim.held().is_empty());
}

#[test]
fn a_held_group_cannot_be_bound_twice() {
    let sim = platform();
    let first =
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default()).unwrap();
    let held = sim.held();
    assert!(
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default())
            .is_err()
    );
    assert_eq!(sim.held(), held);
    first.teardown().unwrap();
}

#[test]
fn status_reports_firmware_values() {
    let sim = SimPlatform::builder()
        .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0"])
        .firmware(SimFirmware {
            attributes: TileAttributes {
                id: 0,
                major: 3,
                minor: 4,
            },
            sl_version: SlVersion {
                major: 10,
                minor: 2,
                revision: 5,
            },
            state: TileState::Running,
            time_of_day: 0,
        })
        .build();
    let mut acc =
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default()).unwrap();
    let status = acc.status().unwrap();
    assert_eq!(
        status.to_string(),
        "AIOP Tile Status:\n\t Major Version: 3, Minor Version: 4\n\t Service Layer:- Major Version: 10, Minor Version: 2, Revision: 5\n\t State: RUNNING"
    );
}

#[test]
fn time_of_day_round_trips_through_the_tile() {
    let sim = platform();
    let mut acc =
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default()).unwrap();
    acc.set_time_of_day(1_700_000_000_000).unwrap();
    assert_eq!(acc.time_of_day().unwrap(), 1_700_000_000_000);
    assert_eq!(sim.firmware().time_of_day, 1_700_000_000_000);
    assert_eq!(sim.held().tokens, 0);
}

#[test]
fn reset_returns_tile_to_reset_done() {
    let sim = SimPlatform::builder()
        .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0"])
        .firmware(SimFirmware {
            state: TileState::Running,
            ..SimFirmware::default()
        })
        .build();
    let mut acc =
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default()).unwrap();
    sim.clear_calls();
    acc.reset().unwrap();
    assert_eq!(
        sim.remote_calls(),
        vec![RemoteCall::Open(0), RemoteCall::Reset, RemoteCall::Close]
    );
    assert_eq!(sim.firmware().state, TileState::ResetDone);
}

#[test]
fn failed_reset_is_reported() {
    let sim = platform();
    let mut acc =
        Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default()).unwrap();
    sim.inject(Fault::Reset);
    assert!(matches!(
        acc.reset(),
        Err(AiopError::Firmware { op: "reset", .. })
    ));
    assert_eq!(sim.held().tokens, 0);
}

#[test]
fn platform_listing_contains_container_object() {
    let sim = platform();
    let names = sim.group_devices(GroupId(7)).unwrap();
    assert_eq!(names[0], "dprc.5");
    assert_eq!(
        sim.container_group(&ContainerName::default()).unwrap(),
        GroupId(7)
    );
}

#[test]
#[ignore] // Requires an LS2088A/LX2160A board with the container bound to vfio-fsl-mc
fn hardware_status() {
    let name: ContainerName = std::env::var("DPRC")
        .unwrap_or_else(|_| "dprc.5".into())
        .parse()
        .expect("container name");
    let mut acc = Accelerator::init(VfioPlatform::default(), ResourcePool::default(), &name)
        .expect("bind AIOP tile");
    let status = acc.status().expect("tile status");
    println!("{status}");
    println!("Time of day: {}", acc.time_of_day().expect("time of day"));
    acc.teardown().expect("release");
}
