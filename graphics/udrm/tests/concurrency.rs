use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use udrm::{
    ClipRect, ConnectorStatus, DamageReport, EdidBuilder, Mode, SoftDisplay, UdrmConfig, UdrmDevice,
    UdrmNode,
};

#[test]
fn test_concurrent_sessions_bind_once() {
    const SESSIONS: usize = 8;

    let display = SoftDisplay::new();
    let node = UdrmNode::new(display.clone(), UdrmConfig::default());
    let channel = node.open();
    let device = channel.device().clone();

    for round in 1..=3u64 {
        let opened = Arc::new(Barrier::new(SESSIONS + 1));
        let release = Arc::new(Barrier::new(SESSIONS + 1));

        let workers: Vec<_> = (0..SESSIONS)
            .map(|_| {
                let device = device.clone();
                let opened = opened.clone();
                let release = release.clone();
                thread::spawn(move || {
                    let session = device.open_session().unwrap();
                    opened.wait();
                    release.wait();
                    drop(session);
                })
            })
            .collect();

        opened.wait();
        assert_eq!(device.bind_count(), SESSIONS);
        assert_eq!(display.stats(device.name()).inits, round);
        release.wait();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(device.bind_count(), 0);
        assert!(!device.is_bound());
        let stats = display.stats(device.name());
        assert_eq!((stats.inits, stats.cleanups), (round, round));
    }
}

#[test]
fn test_sessions_race_with_registration() {
    let display = SoftDisplay::new();
    let node = UdrmNode::new(display.clone(), UdrmConfig::default());
    let channel = node.open();
    let device = channel.device().clone();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let device = device.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let session = device.open_session().unwrap();
                    assert!(device.is_bound());
                    drop(session);
                }
            })
        })
        .collect();

    channel.register().unwrap();
    channel.unregister().unwrap();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(device.bind_count(), 0);
    let stats = display.stats(device.name());
    assert_eq!(stats.inits, stats.cleanups);
}

fn notify(device: &UdrmDevice, seen: &AtomicUsize) {
    if let Some(controller) = device.acquire_controller() {
        // A reachable controller is never one whose channel is gone
        assert!(controller.is_open());
        controller.deliver(DamageReport {
            fb_id: 1,
            clips: vec![ClipRect::full(1, 1)],
        });
        seen.fetch_add(1, Ordering::Relaxed);
        device.release_controller(controller);
    }
}

#[test]
fn test_close_races_with_damage_notification() {
    let display = SoftDisplay::new();
    let node = UdrmNode::new(display.clone(), UdrmConfig::default());

    for _ in 0..200 {
        let channel = node.open();
        channel.register().unwrap();
        let device = channel.device().clone();
        let controller = channel.controller().clone();

        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicUsize::new(0));

        let notifiers: Vec<_> = (0..2)
            .map(|_| {
                let device = device.clone();
                let stop = stop.clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        notify(&device, &seen);
                        device.forward_damage(DamageReport {
                            fb_id: 2,
                            clips: vec![ClipRect::full(1, 1)],
                        });
                    }
                })
            })
            .collect();

        thread::yield_now();
        channel.close();
        assert!(!controller.is_open());
        assert!(device.acquire_controller().is_none());

        stop.store(true, Ordering::Relaxed);
        for notifier in notifiers {
            notifier.join().unwrap();
        }

        assert_eq!(controller.pending_damage(), 0);
        assert!(!display.is_visible(device.name()));
        assert_eq!(Arc::strong_count(&device), 1);
    }
}

#[test]
fn test_channels_do_not_contend() {
    let display = SoftDisplay::new();
    let node = Arc::new(UdrmNode::new(display.clone(), UdrmConfig::default()));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let node = node.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let channel = node.open();
                    channel.register().unwrap();
                    channel.plug(None).unwrap();
                    channel.unplug().unwrap();
                    channel.close();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(display.devices().is_empty());
}

#[test]
fn test_connector_snapshot_under_hotplug() {
    let display = SoftDisplay::new();
    let node = UdrmNode::new(display.clone(), UdrmConfig::default());
    let channel = Arc::new(node.open());
    channel.register().unwrap();
    let session = display.open(channel.device().name()).unwrap();

    let edid = EdidBuilder::new()
        .mode(&Mode::cvt(1920, 1080, 60))
        .size_cm(52, 29)
        .build();
    let stop = Arc::new(AtomicBool::new(false));

    let toggler = {
        let channel = channel.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                channel.plug(Some(&edid)).unwrap();
                channel.unplug().unwrap();
            }
        })
    };

    for _ in 0..2000 {
        let info = session.connector().unwrap();
        match info.status {
            ConnectorStatus::Connected => {
                assert_eq!(info.modes[0].hdisplay, 1920);
                assert_eq!((info.width_mm, info.height_mm), (520, 290));
            }
            _ => {
                assert_eq!(info.modes[0].name, "800x600");
                assert_eq!((info.width_mm, info.height_mm), (0, 0));
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    toggler.join().unwrap();
}
