//! Dry run of a full load against the simulated platform
//!
//! Stages a generated image, loads and starts it, then prints the tile
//! status and every platform call that was made.

use aiop_driver::sim::SimPlatform;
use aiop_driver::{Accelerator, ContainerName, LoadRequest, ResourcePool, Result};
use std::io::Write;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("aiop_driver=debug")
        .init();

    let mut image = tempfile::NamedTempFile::new()?;
    image.write_all(&[0x7f; 12 * 1024])?;

    let sim = SimPlatform::builder()
        .container("dprc.5", 7, &["dpmcp.23", "dpaiop.0", "dpni.1"])
        .build();
    let mut tile = Accelerator::init(sim.clone(), ResourcePool::default(), &ContainerName::default())?;
    sim.clear_calls();

    tile.load(&LoadRequest::new(image.path()).with_reset(true))?;
    println!("{}", tile.status()?);
    tile.teardown()?;

    println!("\nPlatform calls:");
    for event in sim.events() {
        println!("  {event:?}");
    }
    println!("\nStill held: {:?}", sim.held());
    Ok(())
}
