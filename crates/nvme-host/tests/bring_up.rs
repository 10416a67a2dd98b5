mod common;

use std::time::Duration;

use common::{attach, attach_with, init_tracing};
use nvme_host::{
    admin_opcode, feature_id, generic_status, log_id, Arbitration, Clock, Controller,
    ControllerOptions, ControllerState, Error, InitStatus, PciId, QpairOptions, QueuePriority,
    Quirks, Status, PCI_VENDOR_MEMBLAZE, PCI_VENDOR_VIRTUALBOX,
};
use nvme_sim::{SimConfig, SimPlatform};

fn pci_id(vendor: u16, device: u16) -> PciId {
    PciId {
        vendor,
        device,
        subvendor: vendor,
        subdevice: 0x0001,
    }
}

/// Steps bring-up by hand, advancing virtual time between steps, until it
/// finishes or fails.
fn step_until_done(plat: &SimPlatform, ctrlr: &Controller) -> Result<(), Error> {
    for _ in 0..100_000 {
        match ctrlr.init_step()? {
            InitStatus::Ready => return Ok(()),
            InitStatus::Pending => plat.sim_clock().advance(Duration::from_millis(1)),
        }
    }
    panic!("bring-up neither finished nor failed");
}

#[test]
fn attach_reaches_ready() {
    let (plat, ctrlr) = attach(SimConfig::default());
    let sim = plat.device();

    assert_eq!(ctrlr.state(), ControllerState::Ready);
    assert!(sim.is_ready());
    assert_eq!(sim.enable_count(), 1);
    assert!(plat.pci_config().memory_enabled());
    assert!(plat.pci_config().bus_master());

    let cc = sim.controller_config();
    assert!(cc.enable);
    assert_eq!(cc.mps, 0);
    assert_eq!(cc.iosqes, 6);
    assert_eq!(cc.iocqes, 4);

    assert_eq!(ctrlr.page_size(), 4096);
    assert_eq!(ctrlr.max_xfer_size(), 4096 << 5);
    assert_eq!(ctrlr.num_io_qpairs(), 1);
    assert_eq!(sim.granted_queues(), Some(1));
    assert!(ctrlr.quirks().is_empty());
}

#[test]
fn start_sequence_configures_events_and_tables() {
    let (plat, ctrlr) = attach(SimConfig::default());
    let sim = plat.device();

    // aerl 3 means four outstanding requests.
    assert_eq!(ctrlr.aer_count(), 4);
    assert_eq!(sim.outstanding_aers(), 4);
    assert_eq!(
        sim.feature(feature_id::ASYNC_EVENT_CONFIGURATION),
        Some(0xff | 1 << 8)
    );

    for lid in [
        log_id::ERROR,
        log_id::HEALTH,
        log_id::FIRMWARE_SLOT,
        log_id::CHANGED_NS_LIST,
    ] {
        assert!(ctrlr.is_log_page_supported(lid), "log page {lid:#x}");
    }
    assert!(!ctrlr.is_log_page_supported(log_id::COMMAND_EFFECTS));
    assert!(!ctrlr.is_log_page_supported(log_id::INTEL_DIRECTORY));
    assert!(ctrlr.is_feature_supported(feature_id::NUMBER_OF_QUEUES));
    assert!(ctrlr.is_feature_supported(feature_id::VOLATILE_WRITE_CACHE));

    let stat = ctrlr.stat().unwrap();
    assert_eq!(stat.serial, "SIM0000000000000001");
    assert_eq!(stat.model, "nvme-sim controller");
    assert_eq!(stat.firmware, "1.0");
    assert_eq!(stat.namespaces, 4);
    assert_eq!(stat.io_qpairs, 1);
    assert_eq!(stat.max_queue_entries, 256);
    assert!(!stat.sgl_supported);

    let namespaces = ctrlr.active_namespaces();
    assert_eq!(namespaces.len(), 1);
    assert_eq!(namespaces[0].id(), 1);
    assert_eq!(namespaces[0].sector_size(), 512);
    assert_eq!(namespaces[0].sectors(), 1 << 20);
    assert!(ctrlr.namespace(2).is_none());
}

#[test]
fn command_effects_log_follows_lpa() {
    let (_plat, ctrlr) = attach(SimConfig {
        lpa: nvme_host::LPA_COMMAND_EFFECTS,
        ..SimConfig::default()
    });
    assert!(ctrlr.is_log_page_supported(log_id::COMMAND_EFFECTS));

    let mut page = vec![0u8; 4096];
    ctrlr
        .get_log_page(log_id::COMMAND_EFFECTS, 0, &mut page)
        .unwrap();
    assert_eq!(page[admin_opcode::IDENTIFY as usize * 4], 1);
}

#[test]
fn controller_left_enabled_is_disabled_first() {
    let (plat, ctrlr) = attach(SimConfig {
        start_enabled: true,
        ..SimConfig::default()
    });
    assert_eq!(ctrlr.state(), ControllerState::Ready);
    // Power-on enable does not count; the host's re-enable does.
    assert_eq!(plat.device().enable_count(), 1);
}

#[test]
fn ready_delay_is_waited_out() {
    let (plat, ctrlr) = attach(SimConfig {
        ready_delay: Duration::from_millis(50),
        ..SimConfig::default()
    });
    assert_eq!(ctrlr.state(), ControllerState::Ready);
    assert!(plat.sim_clock().now() >= Duration::from_millis(50));
    assert!(plat.sim_clock().sleeps() >= 50);
}

#[test]
fn never_ready_times_out_and_fails() {
    init_tracing();
    // CAP.TO of 4 is a two second ready timeout.
    let plat = SimPlatform::new(SimConfig {
        timeout_units: 4,
        never_ready: true,
        ..SimConfig::default()
    });
    let ctrlr = Controller::open(plat.clone(), ControllerOptions::default()).unwrap();
    assert_eq!(ctrlr.state(), ControllerState::Init);
    let described = format!("{ctrlr:?}");
    assert!(described.starts_with("Controller {"), "{described}");
    assert!(described.contains("pci_id"), "{described}");

    let err = step_until_done(&plat, &ctrlr).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    assert!(ctrlr.is_failed());
    assert_eq!(ctrlr.state(), ControllerState::EnableWaitForReady1);
    assert!(plat.sim_clock().now() > Duration::from_secs(2));
    assert!(plat.sim_clock().now() < Duration::from_millis(2100));

    assert!(matches!(ctrlr.init_step(), Err(Error::ControllerFailed)));
}

#[test]
fn attach_reports_ready_timeout() {
    init_tracing();
    let plat = SimPlatform::new(SimConfig {
        timeout_units: 2,
        never_ready: true,
        ..SimConfig::default()
    });
    let err = Controller::attach(plat.clone(), ControllerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Timeout("controller ready")), "{err:?}");
}

#[test]
fn delay_before_check_ready_quirk() {
    let (plat, ctrlr) = attach(SimConfig {
        pci_id: pci_id(PCI_VENDOR_MEMBLAZE, 0x0540),
        start_enabled: true,
        ..SimConfig::default()
    });
    assert!(ctrlr.quirks().contains(Quirks::DELAY_BEFORE_CHECK_READY));
    assert_eq!(ctrlr.state(), ControllerState::Ready);
    assert!(plat.sim_clock().now() >= Duration::from_millis(2000));
}

#[test]
fn delay_before_check_ready_extends_deadline() {
    // A one second ready timeout would expire inside the two second quirk
    // delay if the deadline did not move with it.
    let (plat, ctrlr) = attach(SimConfig {
        pci_id: pci_id(PCI_VENDOR_MEMBLAZE, 0x0540),
        start_enabled: true,
        timeout_units: 2,
        ..SimConfig::default()
    });
    assert_eq!(ctrlr.state(), ControllerState::Ready);
    assert!(plat.sim_clock().now() >= Duration::from_millis(2000));
}

#[test]
fn delay_after_ready_quirk() {
    let (plat, ctrlr) = attach(SimConfig {
        pci_id: pci_id(PCI_VENDOR_VIRTUALBOX, 0x4e56),
        ..SimConfig::default()
    });
    assert!(ctrlr.quirks().contains(Quirks::DELAY_AFTER_READY));
    assert!(plat.sim_clock().now() >= Duration::from_millis(100));

    let (plat, _ctrlr) = attach(SimConfig::default());
    assert!(plat.sim_clock().now() < Duration::from_millis(100));
}

#[test]
fn bar_map_failure_is_reported() {
    init_tracing();
    let plat = SimPlatform::new(SimConfig::default());
    plat.fail_bar_map(0);
    let err = Controller::attach(plat.clone(), ControllerOptions::default()).unwrap_err();
    assert!(matches!(err, Error::BarMap { bar: 0 }), "{err:?}");
}

#[test]
fn identify_failure_fails_controller() {
    init_tracing();
    let plat = SimPlatform::new(SimConfig::default());
    let status = Status::generic(generic_status::INTERNAL_DEVICE_ERROR, true);
    plat.device().inject_error(0, admin_opcode::IDENTIFY, status);

    let ctrlr = Controller::open(plat.clone(), ControllerOptions::default()).unwrap();
    let err = step_until_done(&plat, &ctrlr).unwrap_err();
    assert_eq!(err.status(), Some(status));
    assert!(ctrlr.is_failed());
    assert!(ctrlr.admin_qpair().is_failed());
}

#[test]
fn io_queue_count_is_negotiated() {
    let (plat, ctrlr) = attach_with(
        SimConfig {
            max_io_queues: 2,
            ..SimConfig::default()
        },
        ControllerOptions {
            num_io_queues: 8,
            ..ControllerOptions::default()
        },
    );
    assert_eq!(ctrlr.num_io_qpairs(), 2);
    assert_eq!(plat.device().granted_queues(), Some(2));
}

#[test]
fn io_queue_size_is_clamped_to_mqes() {
    let (_plat, ctrlr) = attach_with(
        SimConfig {
            mqes: 63,
            ..SimConfig::default()
        },
        ControllerOptions {
            io_queue_size: 1024,
            ..ControllerOptions::default()
        },
    );
    let qpair = ctrlr.acquire_io_qpair(QpairOptions::default()).unwrap();
    assert_eq!(qpair.entries(), 64);
    assert_eq!(qpair.num_trackers(), 63);
}

#[test]
fn weighted_round_robin_needs_capability() {
    let opts = ControllerOptions {
        arbitration: Arbitration::WeightedRoundRobin,
        ..ControllerOptions::default()
    };

    let (plat, ctrlr) = attach_with(SimConfig::default(), opts.clone());
    assert_eq!(ctrlr.arbitration(), Arbitration::RoundRobin);
    assert_eq!(plat.device().controller_config().ams, 0);
    let err = ctrlr
        .acquire_io_qpair(QpairOptions {
            priority: QueuePriority::High,
            queue_size: None,
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let (plat, ctrlr) = attach_with(
        SimConfig {
            ams: 1,
            ..SimConfig::default()
        },
        opts,
    );
    assert_eq!(ctrlr.arbitration(), Arbitration::WeightedRoundRobin);
    assert_eq!(plat.device().controller_config().ams, 1);
    let qpair = ctrlr
        .acquire_io_qpair(QpairOptions {
            priority: QueuePriority::High,
            queue_size: None,
        })
        .unwrap();
    assert_eq!(plat.device().sq_priority(qpair.id()), Some(QueuePriority::High as u8));
}
