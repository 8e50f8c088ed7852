//! udrm API self-test runner
//!
//! Drives the control surface end to end against an in-process display
//! subsystem and prints one line per test. Exits non-zero if any test fails.

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, ensure, Context};
use log::{debug, info};
use udrm::cdev::{UDRM_CMD_PLUG, UDRM_CMD_REGISTER, UDRM_CMD_UNPLUG, UDRM_CMD_UNREGISTER};
use udrm::{
    AddressSpace, ConnectorStatus, EdidBuilder, Error, FbCommand, FbFlags, Mode, PixelFormat,
    PlugArgs, SoftDisplay, UdrmConfig, UdrmNode,
};

struct Test {
    name: &'static str,
    main: fn(&Harness) -> anyhow::Result<()>,
}

const TESTS: &[Test] = &[
    Test {
        name: "api-open",
        main: test_api_open,
    },
    Test {
        name: "api-registration",
        main: test_api_registration,
    },
    Test {
        name: "api-plug",
        main: test_api_plug,
    },
    Test {
        name: "api-damage",
        main: test_api_damage,
    },
    Test {
        name: "api-sessions",
        main: test_api_sessions,
    },
];

struct Harness {
    display: Arc<SoftDisplay>,
    node: UdrmNode,
}

impl Harness {
    fn new(config: UdrmConfig) -> Self {
        let display = SoftDisplay::new();
        let node = UdrmNode::new(display.clone(), config);
        Self { display, node }
    }

    fn config(&self) -> &UdrmConfig {
        self.node.config()
    }
}

fn expect_err(result: udrm::Result<()>, expected: Error, what: &str) -> anyhow::Result<()> {
    match result {
        Ok(()) => bail!("{}: succeeded, expected errno {}", what, expected.errno()),
        Err(err) if err == expected => Ok(()),
        Err(err) => bail!(
            "{}: errno {} ({}), expected errno {} ({})",
            what,
            err.errno(),
            err,
            expected.errno(),
            expected
        ),
    }
}

/// Opening and closing a control channel works and leaves nothing behind
fn test_api_open(h: &Harness) -> anyhow::Result<()> {
    let channel = h.node.open();
    let device = channel.device().clone();
    ensure!(device.is_new(), "fresh device is not new");
    channel.close();
    ensure!(
        Arc::strong_count(&device) == 1,
        "device still referenced after close"
    );
    Ok(())
}

/// Simple REGISTER/UNREGISTER sequence
fn test_api_registration(h: &Harness) -> anyhow::Result<()> {
    let channel = h.node.open();
    let mem = AddressSpace::new();

    expect_err(
        channel.ioctl(UDRM_CMD_UNREGISTER, 0, &mem),
        Error::NotConnected,
        "UNREGISTER before REGISTER",
    )?;
    channel
        .ioctl(UDRM_CMD_REGISTER, 0, &mem)
        .context("REGISTER")?;
    expect_err(
        channel.ioctl(UDRM_CMD_REGISTER, 0, &mem),
        Error::AlreadyConnected,
        "second REGISTER",
    )?;
    channel
        .ioctl(UDRM_CMD_UNREGISTER, 0, &mem)
        .context("UNREGISTER")?;
    expect_err(
        channel.ioctl(UDRM_CMD_UNREGISTER, 0, &mem),
        Error::Shutdown,
        "second UNREGISTER",
    )?;
    expect_err(
        channel.ioctl(UDRM_CMD_REGISTER, 0, &mem),
        Error::Shutdown,
        "REGISTER after UNREGISTER",
    )?;
    Ok(())
}

fn plug_args(mem: &mut AddressSpace, edid: &[u8]) -> u64 {
    let ptr_edid = mem.map(edid.to_vec());
    mem.map(
        PlugArgs {
            flags: 0,
            n_edid: edid.len() as u64,
            ptr_edid,
        }
        .to_bytes(),
    )
}

/// PLUG/UNPLUG with EDID; modes follow the plugged monitor
fn test_api_plug(h: &Harness) -> anyhow::Result<()> {
    let channel = h.node.open();
    let device = channel.device().clone();
    let mut mem = AddressSpace::new();

    let edid = EdidBuilder::new()
        .mode(&Mode::cvt(1280, 720, 60))
        .monitor_name("selftest")
        .build();
    let args = plug_args(&mut mem, &edid);

    expect_err(
        channel.ioctl(UDRM_CMD_PLUG, args, &mem),
        Error::NotConnected,
        "PLUG before REGISTER",
    )?;
    channel.register().context("REGISTER")?;

    let mut broken = edid.clone();
    broken[127] = broken[127].wrapping_add(1);
    let broken_args = plug_args(&mut mem, &broken);
    expect_err(
        channel.ioctl(UDRM_CMD_PLUG, broken_args, &mem),
        Error::InvalidArgument,
        "PLUG with bad checksum",
    )?;
    ensure!(!channel.is_plugged(), "rejected PLUG left a monitor plugged");

    channel.ioctl(UDRM_CMD_PLUG, args, &mem).context("PLUG")?;
    ensure!(
        device.connector_status() == ConnectorStatus::Connected,
        "connector not connected after PLUG"
    );
    let modes = device.modes();
    debug!("plugged modes: {:?}", modes);
    ensure!(
        modes.first().map(|m| (m.hdisplay, m.vdisplay)) == Some((1280, 720)),
        "unexpected modes after PLUG: {:?}",
        modes
    );
    expect_err(
        channel.ioctl(UDRM_CMD_PLUG, args, &mem),
        Error::AlreadyConnected,
        "second PLUG",
    )?;

    channel.ioctl(UDRM_CMD_UNPLUG, 0, &mem).context("UNPLUG")?;
    expect_err(
        channel.ioctl(UDRM_CMD_UNPLUG, 0, &mem),
        Error::Already,
        "second UNPLUG",
    )?;
    let fallback = udrm::kms::default_mode(h.config());
    let modes = device.modes();
    ensure!(
        modes.len() == 1 && modes[0].same_timing(&fallback),
        "expected only the default mode {} after UNPLUG, got {:?}",
        fallback.name,
        modes
    );

    let hotplugs = h.display.stats(device.name()).hotplugs;
    ensure!(hotplugs == 2, "expected 2 hotplug events, saw {}", hotplugs);
    Ok(())
}

/// Page flips from a graphics session reach the controller
fn test_api_damage(h: &Harness) -> anyhow::Result<()> {
    let channel = h.node.open();
    channel.register().context("REGISTER")?;
    channel.plug(None).context("PLUG")?;

    let session = h
        .display
        .open(channel.device().name())
        .context("open session")?;
    let dumb = session.create_dumb(640, 480, 32).context("create dumb")?;
    let fb = session
        .add_framebuffer(&FbCommand {
            width: 640,
            height: 480,
            format: PixelFormat::XRGB8888,
            flags: FbFlags::empty(),
            handle: dumb.handle,
            pitch: dumb.pitch,
            offset: 0,
        })
        .context("add framebuffer")?;

    let event = session.page_flip(fb).context("page flip")?;
    debug!("vblank {}", event.sequence);

    let report = channel
        .read_damage()
        .context("no damage after page flip")?;
    ensure!(report.fb_id == fb, "damage for fb {}, expected {}", report.fb_id, fb);
    ensure!(channel.read_damage().is_none(), "spurious damage report");
    Ok(())
}

/// Concurrent sessions bind the device once
fn test_api_sessions(h: &Harness) -> anyhow::Result<()> {
    let channel = h.node.open();
    let device = channel.device().clone();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let device = device.clone();
            thread::spawn(move || -> udrm::Result<()> {
                for _ in 0..100 {
                    let session = device.open_session()?;
                    session.create_dumb(128, 128, 32)?;
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        match worker.join() {
            Ok(result) => result.context("session worker")?,
            Err(_) => bail!("session worker panicked"),
        }
    }

    let stats = h.display.stats(device.name());
    ensure!(device.bind_count() == 0, "bindings leaked");
    ensure!(
        stats.inits == stats.cleanups,
        "mode surface built {} times, torn down {} times",
        stats.inits,
        stats.cleanups
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = UdrmConfig::from_env();
    info!("udrm-selftest: {:?}", config);

    let mut failed = 0;
    for test in TESTS {
        let harness = Harness::new(config.clone());
        match (test.main)(&harness) {
            Ok(()) => println!("{:<20} OK", test.name),
            Err(err) => {
                failed += 1;
                println!("{:<20} FAIL: {:#}", test.name, err);
            }
        }
    }

    if failed > 0 {
        println!("{} of {} tests failed", failed, TESTS.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
