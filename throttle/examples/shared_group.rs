use std::{sync::Arc, time::Instant};

use futures::future::join_all;

use throttle::{Direction, MemberOptions, Registry, ThrottleConfig};

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    // Both disks join the same group and share its budget of 20 writes per second.
    let registry: Registry = Registry::default();
    let fast = Arc::new(registry.register("disks", MemberOptions::default()).unwrap());
    let slow = Arc::new(registry.register("disks", MemberOptions::default()).unwrap());

    let config: ThrottleConfig = "iops-total=20,bps-total=1048576".parse().unwrap();
    fast.set_config(config).unwrap();

    let start = Instant::now();
    let mut writes = Vec::new();

    // The first disk floods the group, the second only issues a few writes.
    for (name, disk, count) in [("fast", &fast, 30), ("slow", &slow, 5)] {
        for i in 0..count {
            let disk = Arc::clone(disk);
            writes.push(tokio::spawn(async move {
                disk.admit(4096, Direction::Write).await;
                println!("{:>6} ms  {name} write #{i}", start.elapsed().as_millis());
            }));
        }
    }

    join_all(writes).await;

    for (name, disk) in [("fast", &fast), ("slow", &slow)] {
        let stats = disk.stats();
        println!(
            "{name}: {} writes, {} bytes, {} throttled",
            stats.admitted(Direction::Write),
            stats.bytes(Direction::Write),
            stats.throttled(Direction::Write)
        );
    }
}
