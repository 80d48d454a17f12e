//! List the RDMA devices on this host.
//!
//! The printed index is what `TENSORLINK_RDMA_DEVICE` selects.
//!
//! ```bash
//! cargo run --example list_devices --features verbs
//! ```

use tensorlink::fabric::verbs::list_devices;

fn main() -> tensorlink::Result<()> {
    let devices = list_devices()?;
    if devices.is_empty() {
        println!("no RDMA devices found");
        return Ok(());
    }
    for dev in &devices {
        println!("{:>2}  {dev}", dev.index);
    }
    Ok(())
}
