use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::FutureExt;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use throttle_group::{
    Clock, Direction, EventLoop, MemberOptions, Registry, ThrottleConfig, ThrottleGroupMember,
    VirtualClock,
};

use crate::{drive, ms, settle, FixedDelay};

#[tokio::test]
async fn turn_passes_to_the_waiting_member() {
    let _ = tracing_subscriber::fmt::try_init();
    let clock = VirtualClock::new();
    let registry: Registry = Registry::new(Clock::from(clock.clone()));

    let m1 = Arc::new(registry.register("disks", MemberOptions::default()).unwrap());
    let m2 = Arc::new(registry.register("disks", MemberOptions::default()).unwrap());
    m1.set_config("iops-write=1".parse().unwrap()).unwrap();
    let group = m1.group().clone();

    assert!(m1.admit(512, Direction::Write).now_or_never().is_some());

    let r2 = tokio::spawn({
        let m1 = Arc::clone(&m1);
        async move { m1.admit(512, Direction::Write).await }
    });
    settle().await;
    assert!(m1.timer_deadline(Direction::Write).is_some());

    // M2 queues behind the timer that is armed on M1.
    let r3 = tokio::spawn({
        let m2 = Arc::clone(&m2);
        async move { m2.admit(512, Direction::Write).await }
    });
    settle().await;
    assert_eq!(m2.pending(Direction::Write), 1);
    assert_eq!(group.armed_timers(Direction::Write), 1);
    assert!(m2.timer_deadline(Direction::Write).is_none());

    clock.advance_to_next().unwrap();
    settle().await;
    r2.await.unwrap();

    // M1's request went through and handed the turn to M2, whose own timer is now armed.
    assert_eq!(group.token(Direction::Write), Some(m2.id()));
    assert!(m1.timer_deadline(Direction::Write).is_none());
    let deadline = m2.timer_deadline(Direction::Write).unwrap();
    assert!(deadline > ms(1800) && deadline < ms(2000), "unexpected deadline {deadline:?}");
    assert!(!r3.is_finished());

    clock.advance_to_next().unwrap();
    settle().await;
    r3.await.unwrap();

    assert_eq!(m2.pending(Direction::Write), 0);
    assert!(!group.timer_armed(Direction::Write));
}

#[tokio::test]
async fn turns_rotate_between_busy_members() {
    let _ = tracing_subscriber::fmt::try_init();
    let clock = VirtualClock::new();
    let registry = Registry::<FixedDelay>::new(Clock::from(clock.clone()));

    let members: Vec<_> = (0..3)
        .map(|_| Arc::new(registry.register("disks", MemberOptions::default()).unwrap()))
        .collect();
    members[0].set_config(Some(ms(10))).unwrap();
    let group = members[0].group().clone();

    let completed = Arc::new(Mutex::new(Vec::new()));
    for member in &members {
        for _ in 0..4 {
            let member = Arc::clone(member);
            let completed = Arc::clone(&completed);
            tokio::spawn(async move {
                member.admit(4096, Direction::Write).await;
                completed.lock().push(member.id());
            });
        }
    }

    drive(&clock, || {
        assert!(group.armed_timers(Direction::Write) <= 1);
        completed.lock().len() == 12
    })
    .await;

    // Every request waited for its own timer, one after the other.
    assert_eq!(clock.now(), ms(120));

    let completed = completed.lock();
    for round in completed.chunks(3) {
        let distinct: HashSet<_> = round.iter().collect();
        assert_eq!(distinct.len(), 3, "member served twice in one round: {completed:?}");
    }
}

#[tokio::test]
async fn random_workload_completes() {
    let _ = tracing_subscriber::fmt::try_init();
    let clock = VirtualClock::new();
    let registry: Registry = Registry::new(Clock::from(clock.clone()));
    let mut rng = StdRng::seed_from_u64(0x7417);

    let members: Vec<_> = (0..4)
        .map(|_| Arc::new(registry.register("disks", MemberOptions::default()).unwrap()))
        .collect();
    let config: ThrottleConfig = "bps-total=65536,iops-total=50".parse().unwrap();
    members[0].set_config(config).unwrap();
    let group = members[0].group().clone();

    let total = 200;
    let completed = Arc::new(Mutex::new(0));
    for _ in 0..total {
        let member = Arc::clone(&members[rng.gen_range(0..members.len())]);
        let direction = if rng.gen_bool(0.5) { Direction::Read } else { Direction::Write };
        let bytes = rng.gen_range(512..=16 * 1024);
        let completed = Arc::clone(&completed);

        tokio::spawn(async move {
            member.admit(bytes, direction).await;
            *completed.lock() += 1;
        });

        // Let some requests arrive while others are already waiting.
        if rng.gen_bool(0.2) {
            settle().await;
            clock.advance(Duration::from_millis(rng.gen_range(0..20)));
        }
    }

    drive(&clock, || {
        for d in Direction::ALL {
            assert!(group.armed_timers(d) <= 1);
            assert_eq!(group.armed_timers(d) == 1, group.timer_armed(d));
        }
        *completed.lock() == total
    })
    .await;

    let admitted: u64 = members
        .iter()
        .flat_map(|m| Direction::ALL.map(|d| m.stats().admitted(d)))
        .sum();
    assert_eq!(admitted, total);

    for member in &members {
        for d in Direction::ALL {
            assert_eq!(member.pending(d), 0);
            assert_eq!(member.queued(d), 0);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn members_on_different_runtimes_share_the_limit() {
    let _ = tracing_subscriber::fmt::try_init();
    let registry: Registry = Registry::new(Clock::realtime());

    let other = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();

    let local = Arc::new(registry.register("disks", MemberOptions::default()).unwrap());
    let remote: Arc<ThrottleGroupMember> = Arc::new(
        registry
            .register("disks", MemberOptions::default().event_loop(EventLoop::from(other.handle().clone())))
            .unwrap(),
    );
    local.set_config("iops-total=100".parse().unwrap()).unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let direction = if i % 2 == 0 { Direction::Read } else { Direction::Write };

        let local = Arc::clone(&local);
        tasks.push(tokio::spawn(async move { local.admit(4096, direction).await }));

        let remote = Arc::clone(&remote);
        tasks.push(other.spawn(async move { remote.admit(4096, direction).await }));
    }

    let all = futures::future::join_all(tasks);
    let results = tokio::time::timeout(Duration::from_secs(10), all).await.unwrap();
    assert!(results.into_iter().all(|r| r.is_ok()));

    assert_eq!(local.stats().admitted(Direction::Read) + local.stats().admitted(Direction::Write), 20);
    assert_eq!(
        remote.stats().admitted(Direction::Read) + remote.stats().admitted(Direction::Write),
        20
    );

    drop(remote);
    drop(local);
    other.shutdown_background();
}
