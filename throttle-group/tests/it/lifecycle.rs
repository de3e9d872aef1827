use std::{sync::Arc, time::Duration};

use futures::FutureExt;
use throttle_group::{
    Clock, Direction, MemberOptions, RegisterError, Registry, ThrottleConfig, VirtualClock,
};

use crate::{drive, settle};

fn registry() -> (Registry, VirtualClock) {
    let clock = VirtualClock::new();
    (Registry::new(Clock::from(clock.clone())), clock)
}

#[tokio::test]
async fn group_lives_as_long_as_its_members() {
    let _ = tracing_subscriber::fmt::try_init();
    let (registry, _clock) = registry();

    let a1 = registry.register("a", MemberOptions::default()).unwrap();
    let a2 = registry.register("a", MemberOptions::default()).unwrap();
    let b1 = registry.register("b", MemberOptions::default()).unwrap();

    assert!(a1.group().same_group(a2.group()));
    assert!(!a1.group().same_group(b1.group()));
    assert_eq!(a1.group_name(), "a");
    assert_eq!(a1.group().refcount(), 2);
    assert_eq!(registry.len(), 2);

    // Configuring through one member is visible through the other.
    a1.set_config("iops-read=100".parse().unwrap()).unwrap();
    assert_eq!(a2.get_config(), a1.get_config());
    assert!(!b1.get_config().is_enabled());

    a1.unregister();
    assert!(registry.contains("a"));
    assert_eq!(a2.group().member_count(), 1);

    a2.unregister();
    assert!(!registry.contains("a"));
    assert!(registry.contains("b"));

    // A new group with the same name starts unconfigured.
    let a3 = registry.register("a", MemberOptions::default()).unwrap();
    assert!(!a3.get_config().is_enabled());
    assert_eq!(a3.group().token(Direction::Read), Some(a3.id()));
}

#[tokio::test]
async fn group_handle_keeps_the_group_alive() {
    let _ = tracing_subscriber::fmt::try_init();
    let (registry, _clock) = registry();

    let handle = registry.acquire_group("a");
    handle.configure("bps-total=4096".parse().unwrap()).unwrap();

    let member = registry.register("a", MemberOptions::default()).unwrap();
    assert_eq!(handle.token(Direction::Read), Some(member.id()));
    member.unregister();

    assert_eq!(handle.token(Direction::Read), None);
    assert_eq!(handle.member_count(), 0);
    assert!(registry.contains("a"));
    assert_eq!(handle.config().bucket(throttle_group::BucketType::BpsTotal).avg, 4096);

    registry.release_group(handle);
    assert!(registry.is_empty());
}

#[test]
fn register_needs_an_event_loop() {
    let registry: Registry = Registry::new(Clock::virtual_clock());
    let result = registry.register("a", MemberOptions::default());

    assert!(matches!(result, Err(RegisterError::NoEventLoop)));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn unregistering_hands_the_timer_over() {
    let _ = tracing_subscriber::fmt::try_init();
    let (registry, clock) = registry();

    let m1 = registry.register("disks", MemberOptions::default()).unwrap();
    let m2 = Arc::new(registry.register("disks", MemberOptions::default()).unwrap());
    m1.set_config("iops-write=1".parse().unwrap()).unwrap();
    let group = m1.group().clone();

    assert!(m1.admit(512, Direction::Write).now_or_never().is_some());

    // Leaves a timer armed on M1 with nothing of M1's waiting for it.
    assert!(m1.admit(512, Direction::Write).now_or_never().is_none());
    assert!(m1.timer_deadline(Direction::Write).is_some());

    let waiting = tokio::spawn({
        let m2 = Arc::clone(&m2);
        async move { m2.admit(512, Direction::Write).await }
    });
    settle().await;
    assert_eq!(m2.pending(Direction::Write), 1);

    let m1_id = m1.id();
    m1.unregister();

    assert_eq!(group.members(), vec![m2.id()]);
    assert_eq!(group.pending(m1_id, Direction::Write), None);
    assert_eq!(group.token(Direction::Write), Some(m2.id()));
    assert!(m2.timer_deadline(Direction::Write).is_some());
    assert_eq!(group.armed_timers(Direction::Write), 1);

    drive(&clock, || waiting.is_finished()).await;
    waiting.await.unwrap();
}

#[tokio::test]
async fn restart_drains_the_queues() {
    let _ = tracing_subscriber::fmt::try_init();
    let (registry, clock) = registry();

    let member = Arc::new(registry.register("disks", MemberOptions::default()).unwrap());
    member.set_config("iops-total=1".parse().unwrap()).unwrap();
    assert!(member.admit(512, Direction::Write).now_or_never().is_some());

    let mut tasks = Vec::new();
    for direction in [Direction::Write, Direction::Read, Direction::Write] {
        let member = Arc::clone(&member);
        tasks.push(tokio::spawn(async move { member.admit(512, direction).await }));
    }
    settle().await;
    assert_eq!(member.queued(Direction::Write), 2);
    assert_eq!(member.queued(Direction::Read), 1);

    member.restart();
    settle().await;

    for task in tasks {
        assert!(task.is_finished());
        task.await.unwrap();
    }

    assert_eq!(clock.now(), Duration::ZERO);
    assert_eq!(member.pending(Direction::Write), 0);
    assert_eq!(member.pending(Direction::Read), 0);

    // The timer that was armed for the drained requests fires into an empty queue.
    drive(&clock, || !member.group().timer_armed(Direction::Write)).await;
    drive(&clock, || !member.group().timer_armed(Direction::Read)).await;
}

#[tokio::test]
async fn disabling_limits_flushes_and_bypasses() {
    let _ = tracing_subscriber::fmt::try_init();
    let (registry, _clock) = registry();

    let member = Arc::new(registry.register("disks", MemberOptions::default()).unwrap());
    member.set_config("iops-write=1".parse().unwrap()).unwrap();
    assert!(member.admit(512, Direction::Write).now_or_never().is_some());

    let waiting = tokio::spawn({
        let member = Arc::clone(&member);
        async move { member.admit(512, Direction::Write).await }
    });
    settle().await;
    assert_eq!(member.queued(Direction::Write), 1);

    {
        let _outer = member.disable_limits();
        let inner = member.disable_limits();
        assert!(member.limits_disabled());

        settle().await;
        assert!(waiting.is_finished());

        for _ in 0..10 {
            assert!(member.admit(512, Direction::Write).now_or_never().is_some());
        }

        drop(inner);
        assert!(member.limits_disabled());
    }

    assert!(!member.limits_disabled());
    assert_eq!(member.stats().admitted(Direction::Write), 12);

    // Limits apply again.
    assert!(member.admit(512, Direction::Write).now_or_never().is_none());
    assert_eq!(member.get_config(), "iops-write=1".parse::<ThrottleConfig>().unwrap());
}
