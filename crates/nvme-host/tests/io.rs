mod common;

use std::sync::{Arc, Mutex};

use common::{attach, attach_with, pattern, poll_until, Buffer, Outcomes};
use nvme_host::{
    generic_status, log_id, nvm_opcode, AcquireAction, Controller, ControllerOptions, DsmRange,
    Error, IoFlags, Namespace, NamespaceFlags, PciId, PersistAction, Psdt, QpairOptions,
    QueuePair, RegisterAction, ReleaseAction, ReservationType, Segment, SharedSgl, Status,
    DSM_MAX_RANGES, PCI_VENDOR_INTEL,
};
use nvme_sim::{NamespaceSpec, SegmentList, SimConfig, SimPlatform};
use proptest::prelude::*;

struct Io {
    plat: Arc<SimPlatform>,
    ctrlr: Controller,
    qpair: Arc<QueuePair>,
    ns: Arc<Namespace>,
}

fn setup(config: SimConfig) -> Io {
    setup_with(config, ControllerOptions::default(), QpairOptions::default())
}

fn setup_with(config: SimConfig, opts: ControllerOptions, qopts: QpairOptions) -> Io {
    let (plat, ctrlr) = attach_with(config, opts);
    let qpair = ctrlr.acquire_io_qpair(qopts).unwrap();
    let ns = ctrlr.namespace(1).unwrap();
    Io {
        plat,
        ctrlr,
        qpair,
        ns,
    }
}

impl Io {
    fn write(&self, buf: u64, lba: u64, count: u32) -> Status {
        let done = Outcomes::new();
        self.ns
            .write(&self.qpair, buf, lba, count, IoFlags::empty(), done.callback())
            .unwrap();
        poll_until(&self.qpair, &done, 1);
        done.statuses()[0]
    }

    fn read(&self, buf: u64, lba: u64, count: u32) -> Status {
        let done = Outcomes::new();
        self.ns
            .read(&self.qpair, buf, lba, count, IoFlags::empty(), done.callback())
            .unwrap();
        poll_until(&self.qpair, &done, 1);
        done.statuses()[0]
    }
}

fn sgl(segments: Vec<Segment>) -> SharedSgl {
    Arc::new(Mutex::new(SegmentList::new(segments)))
}

#[test]
fn write_then_read_back() {
    let io = setup(SimConfig::default());
    let data = pattern(4096, 7);
    let src = Buffer::new(&io.plat, 4096);
    src.fill(&data);

    assert!(io.write(src.vaddr(), 100, 8).is_success());
    assert_eq!(io.plat.device().read_blocks(1, 100, 8), data);

    let dst = Buffer::new(&io.plat, 4096);
    assert!(io.read(dst.vaddr(), 100, 8).is_success());
    assert_eq!(dst.contents(), data);
    assert_eq!(io.plat.device().count_commands(1, nvm_opcode::WRITE), 1);
    assert_eq!(io.plat.device().count_commands(1, nvm_opcode::READ), 1);
}

#[test]
fn unaligned_multi_page_buffer_uses_prp_list() {
    let io = setup(SimConfig::default());
    let len = 64 * 1024;
    let data = pattern(len, 3);
    let buf = Buffer::new(&io.plat, len + 4096);
    let vaddr = buf.vaddr() + 512;
    io.plat.dma().write_cpu(vaddr, &data);

    assert!(io.write(vaddr, 0, (len / 512) as u32).is_success());
    assert_eq!(io.plat.device().read_blocks(1, 0, 128), data);

    let cmd = io
        .plat
        .device()
        .commands()
        .into_iter()
        .rfind(|c| c.qid == 1)
        .unwrap()
        .cmd;
    assert_eq!(cmd.psdt, Psdt::Prp);
    assert_eq!(cmd.prp1, buf.bus() + 512);
    assert_ne!(cmd.prp2, 0);
}

#[test]
fn transfer_larger_than_mdts_is_split() {
    let io = setup(SimConfig::default());
    assert_eq!(io.ns.max_io_sectors(), 256);

    let len = 512 * 512;
    let data = pattern(len, 11);
    let buf = Buffer::new(&io.plat, len);
    buf.fill(&data);

    let done = Outcomes::new();
    io.ns
        .write(&io.qpair, buf.vaddr(), 1000, 512, IoFlags::empty(), done.callback())
        .unwrap();
    poll_until(&io.qpair, &done, 1);
    assert!(done.all_succeeded());
    assert_eq!(done.len(), 1);
    assert_eq!(io.plat.device().count_commands(1, nvm_opcode::WRITE), 2);
    assert_eq!(io.plat.device().read_blocks(1, 1000, 512), data);
}

#[test]
fn intel_striping_splits_at_stripe_boundary() {
    let config = SimConfig {
        pci_id: PciId {
            vendor: PCI_VENDOR_INTEL,
            device: 0x0953,
            subvendor: PCI_VENDOR_INTEL,
            subdevice: 0x3702,
        },
        stripe_hint: 2,
        ..SimConfig::default()
    };
    let plat = SimPlatform::new(config);
    let mut directory = vec![0u8; 512];
    directory[392] = 1;
    plat.device().set_log_page(log_id::INTEL_DIRECTORY, directory);
    plat.device().set_log_page(log_id::INTEL_SMART, vec![0x5a; 512]);
    common::init_tracing();
    let ctrlr = Controller::attach(plat.clone(), ControllerOptions::default()).unwrap();

    assert!(ctrlr.is_log_page_supported(log_id::INTEL_DIRECTORY));
    assert!(ctrlr.is_log_page_supported(log_id::INTEL_READ_LATENCY));
    assert!(ctrlr.is_log_page_supported(log_id::INTEL_SMART));
    assert!(!ctrlr.is_log_page_supported(log_id::INTEL_TEMPERATURE));
    let mut smart = vec![0u8; 512];
    ctrlr.get_log_page(log_id::INTEL_SMART, 0, &mut smart).unwrap();
    assert_eq!(smart, vec![0x5a; 512]);

    let ns = ctrlr.namespace(1).unwrap();
    // Four pages of 512-byte sectors.
    assert_eq!(ns.stripe_sectors(), 32);
    assert_eq!(ns.split_ranges(30, 4), vec![(30, 2), (32, 2)]);

    let qpair = ctrlr.acquire_io_qpair(QpairOptions::default()).unwrap();
    let data = pattern(2048, 5);
    let buf = Buffer::new(&plat, 2048);
    buf.fill(&data);
    let done = Outcomes::new();
    ns.write(&qpair, buf.vaddr(), 30, 4, IoFlags::empty(), done.callback())
        .unwrap();
    poll_until(&qpair, &done, 1);
    assert!(done.all_succeeded());

    let writes: Vec<_> = plat
        .device()
        .commands()
        .into_iter()
        .filter(|c| c.qid == 1 && c.cmd.opc == nvm_opcode::WRITE)
        .map(|c| (c.cmd.cdw10, c.cmd.cdw12 & 0xffff))
        .collect();
    assert_eq!(writes, vec![(30, 1), (32, 1)]);
    assert_eq!(plat.device().read_blocks(1, 30, 4), data);
}

#[test]
fn scattered_payload_as_prp() {
    let io = setup(SimConfig::default());
    let bufs: Vec<_> = (0..3).map(|_| Buffer::new(&io.plat, 4096)).collect();
    let mut expected = Vec::new();
    for (i, buf) in bufs.iter().enumerate() {
        let chunk = pattern(4096, i as u8 * 40);
        buf.fill(&chunk);
        expected.extend_from_slice(&chunk);
    }
    let segments = bufs
        .iter()
        .map(|b| Segment {
            bus: b.bus(),
            len: 4096,
        })
        .collect();

    let done = Outcomes::new();
    io.ns
        .writev(&io.qpair, sgl(segments), 8, 24, IoFlags::empty(), done.callback())
        .unwrap();
    poll_until(&io.qpair, &done, 1);
    assert!(done.all_succeeded());
    assert_eq!(io.plat.device().read_blocks(1, 8, 24), expected);
}

#[test]
fn misaligned_scatter_without_sgl_support_is_rejected() {
    let io = setup(SimConfig::default());
    let a = Buffer::new(&io.plat, 4096);
    let b = Buffer::new(&io.plat, 4096);
    let segments = vec![
        Segment {
            bus: a.bus(),
            len: 1536,
        },
        Segment {
            bus: b.bus(),
            len: 2560,
        },
    ];

    let done = Outcomes::new();
    io.ns
        .writev(&io.qpair, sgl(segments), 0, 8, IoFlags::empty(), done.callback())
        .unwrap();
    poll_until(&io.qpair, &done, 1);
    assert_eq!(done.statuses(), vec![Status::invalid_field()]);
    assert_eq!(io.plat.device().count_commands(1, nvm_opcode::WRITE), 0);
}

#[test]
fn scattered_payload_as_sgl() {
    let io = setup(SimConfig {
        sgls: 1,
        ..SimConfig::default()
    });
    assert!(io.ctrlr.sgl_supported());

    let a = Buffer::new(&io.plat, 4096);
    let b = Buffer::new(&io.plat, 4096);
    let data = pattern(4096, 9);
    a.fill(&data[..1536]);
    b.fill(&data[1536..]);
    let segments = vec![
        Segment {
            bus: a.bus(),
            len: 1536,
        },
        Segment {
            bus: b.bus(),
            len: 2560,
        },
    ];

    let done = Outcomes::new();
    io.ns
        .writev(&io.qpair, sgl(segments), 64, 8, IoFlags::empty(), done.callback())
        .unwrap();
    poll_until(&io.qpair, &done, 1);
    assert!(done.all_succeeded());
    assert_eq!(io.plat.device().read_blocks(1, 64, 8), data);

    let cmd = io.plat.device().commands().last().unwrap().cmd;
    assert_ne!(cmd.psdt, Psdt::Prp);

    // Read back into a single segment through readv.
    let dst = Buffer::new(&io.plat, 4096);
    let done = Outcomes::new();
    let segments = vec![Segment {
        bus: dst.bus(),
        len: 4096,
    }];
    io.ns
        .readv(&io.qpair, sgl(segments), 64, 8, IoFlags::empty(), done.callback())
        .unwrap();
    poll_until(&io.qpair, &done, 1);
    assert!(done.all_succeeded());
    assert_eq!(dst.contents(), data);
}

#[test]
fn unmapped_buffer_completes_with_invalid_field() {
    let io = setup(SimConfig::default());
    let buf = Buffer::new(&io.plat, 4096);
    io.plat.dma().unmap(buf.vaddr(), 4096);

    assert_eq!(io.write(buf.vaddr(), 0, 8), Status::invalid_field());
    assert_eq!(io.plat.device().count_commands(1, nvm_opcode::WRITE), 0);
    assert_eq!(io.qpair.outstanding(), 0);
}

#[test]
fn zero_length_transfer_is_rejected() {
    let io = setup(SimConfig::default());
    let err = io
        .ns
        .read(&io.qpair, 0, 0, 0, IoFlags::empty(), |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn out_of_range_lba_fails() {
    let io = setup(SimConfig::default());
    let buf = Buffer::new(&io.plat, 1024);
    let status = io.read(buf.vaddr(), io.ns.sectors() - 1, 2);
    assert!(status.is(nvme_host::status_type::GENERIC, generic_status::LBA_OUT_OF_RANGE));
}

#[test]
fn exhausted_trackers_queue_requests() {
    let io = setup_with(
        SimConfig::default(),
        ControllerOptions::default(),
        QpairOptions {
            queue_size: Some(8),
            ..QpairOptions::default()
        },
    );
    assert_eq!(io.qpair.entries(), 8);
    assert_eq!(io.qpair.num_trackers(), 7);

    let sim = io.plat.device();
    sim.hold_completions(1, true);
    let buf = Buffer::new(&io.plat, 512 * 10);
    buf.fill(&pattern(512 * 10, 1));
    let done = Outcomes::new();
    for i in 0..10u64 {
        io.ns
            .write(
                &io.qpair,
                buf.vaddr() + i * 512,
                i,
                1,
                IoFlags::empty(),
                done.callback(),
            )
            .unwrap();
    }
    assert_eq!(io.qpair.outstanding(), 7);
    assert_eq!(io.qpair.free_trackers(), 0);
    assert_eq!(io.qpair.queued(), 3);
    assert_eq!(io.qpair.poll(0), 0);

    sim.hold_completions(1, false);
    assert_eq!(sim.release_held(1), 7);
    poll_until(&io.qpair, &done, 10);
    assert!(done.all_succeeded());
    assert_eq!(io.qpair.queued(), 0);
    assert_eq!(io.qpair.outstanding(), 0);
    assert_eq!(sim.count_commands(1, nvm_opcode::WRITE), 10);
    assert_eq!(sim.read_blocks(1, 0, 10), pattern(512 * 10, 1));
}

#[test]
fn namespace_not_ready_is_retried() {
    let io = setup(SimConfig::default());
    let sim = io.plat.device();
    let not_ready = Status::generic(generic_status::NAMESPACE_NOT_READY, false);
    let buf = Buffer::new(&io.plat, 512);

    sim.inject_error(1, nvm_opcode::READ, not_ready);
    assert!(io.read(buf.vaddr(), 0, 1).is_success());
    assert_eq!(sim.count_commands(1, nvm_opcode::READ), 2);
    let cids: Vec<_> = sim
        .commands()
        .iter()
        .filter(|c| c.qid == 1)
        .map(|c| c.cmd.cid)
        .collect();
    assert_eq!(cids[0], cids[1]);

    sim.clear_command_log();
    for _ in 0..4 {
        sim.inject_error(1, nvm_opcode::READ, not_ready);
    }
    assert_eq!(io.read(buf.vaddr(), 0, 1), not_ready);
    assert_eq!(sim.count_commands(1, nvm_opcode::READ), 4);
}

#[test]
fn do_not_retry_is_honored() {
    let io = setup(SimConfig::default());
    let sim = io.plat.device();
    let status = Status::generic(generic_status::NAMESPACE_NOT_READY, true);
    sim.inject_error(1, nvm_opcode::READ, status);

    let buf = Buffer::new(&io.plat, 512);
    assert_eq!(io.read(buf.vaddr(), 0, 1), status);
    assert_eq!(sim.count_commands(1, nvm_opcode::READ), 1);
}

#[test]
fn flush_reaches_device() {
    let io = setup(SimConfig::default());
    assert!(io.ns.flags().contains(NamespaceFlags::FLUSH));
    let done = Outcomes::new();
    io.ns.flush(&io.qpair, done.callback()).unwrap();
    poll_until(&io.qpair, &done, 1);
    assert!(done.all_succeeded());
    assert_eq!(io.plat.device().flush_count(), 1);
}

#[test]
fn write_zeroes_clears_blocks() {
    let io = setup(SimConfig::default());
    assert!(io.ns.flags().contains(NamespaceFlags::WRITE_ZEROES));
    let sim = io.plat.device();
    sim.write_blocks(1, 10, &pattern(512 * 4, 2));

    let done = Outcomes::new();
    io.ns
        .write_zeroes(&io.qpair, 11, 2, IoFlags::empty(), done.callback())
        .unwrap();
    poll_until(&io.qpair, &done, 1);
    assert!(done.all_succeeded());

    let blocks = sim.read_blocks(1, 10, 4);
    assert_eq!(&blocks[..512], &pattern(512 * 4, 2)[..512]);
    assert!(blocks[512..1536].iter().all(|&b| b == 0));
    assert_eq!(&blocks[1536..], &pattern(512 * 4, 2)[1536..]);

    let err = io
        .ns
        .write_zeroes(&io.qpair, 0, 65537, IoFlags::empty(), |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn deallocate_trims_ranges() {
    let io = setup(SimConfig::default());
    assert!(io.ns.flags().contains(NamespaceFlags::DEALLOCATE));
    assert!(io.ns.flags().contains(NamespaceFlags::DEALLOCATED_READS_ZERO));
    let sim = io.plat.device();
    sim.write_blocks(1, 0, &pattern(512 * 16, 4));

    let done = Outcomes::new();
    io.ns
        .deallocate(
            &io.qpair,
            &[DsmRange::new(0, 4), DsmRange::new(8, 8)],
            done.callback(),
        )
        .unwrap();
    poll_until(&io.qpair, &done, 1);
    assert!(done.all_succeeded());
    assert_eq!(sim.deallocated_blocks(1), 12);
    let blocks = sim.read_blocks(1, 0, 16);
    assert!(blocks[..2048].iter().all(|&b| b == 0));
    assert_eq!(&blocks[2048..4096], &pattern(512 * 16, 4)[2048..4096]);

    assert!(matches!(
        io.ns.deallocate(&io.qpair, &[], |_| {}),
        Err(Error::InvalidArgument(_))
    ));
    let too_many = vec![DsmRange::new(0, 1); DSM_MAX_RANGES + 1];
    assert!(matches!(
        io.ns.deallocate(&io.qpair, &too_many, |_| {}),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn reservation_lifecycle() {
    let io = setup(SimConfig::default());
    assert!(io.ns.flags().contains(NamespaceFlags::RESERVATION));
    let sim = io.plat.device();
    let key = 0xabcd_0123;

    let run = |submit: &dyn Fn(&Outcomes)| -> Status {
        let done = Outcomes::new();
        submit(&done);
        poll_until(&io.qpair, &done, 1);
        done.statuses()[0]
    };

    let status = run(&|done| {
        io.ns
            .reservation_register(
                &io.qpair,
                RegisterAction::Register,
                false,
                PersistAction::NoChange,
                0,
                key,
                done.callback(),
            )
            .unwrap()
    });
    assert!(status.is_success());

    let status = run(&|done| {
        io.ns
            .reservation_acquire(
                &io.qpair,
                AcquireAction::Acquire,
                false,
                ReservationType::WriteExclusive,
                key + 1,
                0,
                done.callback(),
            )
            .unwrap()
    });
    assert!(status.is(nvme_host::status_type::GENERIC, generic_status::RESERVATION_CONFLICT));

    let status = run(&|done| {
        io.ns
            .reservation_acquire(
                &io.qpair,
                AcquireAction::Acquire,
                false,
                ReservationType::WriteExclusive,
                key,
                0,
                done.callback(),
            )
            .unwrap()
    });
    assert!(status.is_success());
    assert_eq!(sim.reservation(1), (Some(key), Some(1)));

    let report = Buffer::new(&io.plat, 4096);
    let status = run(&|done| {
        io.ns
            .reservation_report(&io.qpair, report.vaddr(), 48, done.callback())
            .unwrap()
    });
    assert!(status.is_success());
    let bytes = report.contents();
    assert_eq!(bytes[4], ReservationType::WriteExclusive as u8);
    assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), 1);
    assert_eq!(u16::from_le_bytes([bytes[24], bytes[25]]), 1);
    assert_eq!(u64::from_le_bytes(bytes[40..48].try_into().unwrap()), key);

    let status = run(&|done| {
        io.ns
            .reservation_release(
                &io.qpair,
                ReleaseAction::Release,
                false,
                ReservationType::WriteExclusive,
                key,
                done.callback(),
            )
            .unwrap()
    });
    assert!(status.is_success());
    assert_eq!(sim.reservation(1), (Some(key), None));

    assert!(matches!(
        io.ns.reservation_report(&io.qpair, report.vaddr(), 6, |_| {}),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn extended_lba_namespace_moves_metadata_inline() {
    let io = setup(SimConfig {
        namespaces: vec![NamespaceSpec::new(1 << 16, 9).with_extended_metadata()],
        ..SimConfig::default()
    });
    assert_eq!(io.ns.sector_size(), 512);
    assert_eq!(io.ns.metadata_size(), 8);
    assert!(io.ns.flags().contains(NamespaceFlags::EXTENDED_LBA));

    let data = pattern(520 * 4, 6);
    let buf = Buffer::new(&io.plat, data.len());
    buf.fill(&data);
    assert!(io.write(buf.vaddr(), 0, 4).is_success());
    assert_eq!(io.plat.device().read_blocks(1, 0, 4), data);
}

#[test]
fn release_aborts_outstanding_requests() {
    let io = setup(SimConfig::default());
    let sim = io.plat.device();
    sim.hold_completions(1, true);
    let buf = Buffer::new(&io.plat, 512);
    let done = Outcomes::new();
    io.ns
        .read(&io.qpair, buf.vaddr(), 0, 1, IoFlags::empty(), done.callback())
        .unwrap();
    assert_eq!(io.qpair.outstanding(), 1);

    io.ctrlr.release_io_qpair(&io.qpair).unwrap();
    assert_eq!(done.statuses(), vec![Status::aborted_by_request()]);
    assert!(sim.io_queues().is_empty());
    assert!(matches!(
        io.ctrlr.release_io_qpair(&io.qpair),
        Err(Error::InvalidHandle)
    ));

    sim.hold_completions(1, false);
    let again = io.ctrlr.acquire_io_qpair(QpairOptions::default()).unwrap();
    assert_eq!(again.id(), 1);
    assert_eq!(sim.io_queues(), vec![1]);
}

#[test]
fn queue_pairs_run_out() {
    let (_plat, ctrlr) = attach(SimConfig::default());
    let _qpair = ctrlr.acquire_io_qpair(QpairOptions::default()).unwrap();
    assert!(matches!(
        ctrlr.acquire_io_qpair(QpairOptions::default()),
        Err(Error::NoQueuePair)
    ));
    assert!(matches!(
        ctrlr.acquire_io_qpair(QpairOptions {
            queue_size: Some(1),
            ..QpairOptions::default()
        }),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn failing_controller_aborts_pending_io() {
    let io = setup(SimConfig::default());
    io.plat.device().hold_completions(1, true);
    let buf = Buffer::new(&io.plat, 512);
    let done = Outcomes::new();
    io.ns
        .read(&io.qpair, buf.vaddr(), 0, 1, IoFlags::empty(), done.callback())
        .unwrap();

    io.ctrlr.fail();
    assert!(io.ctrlr.is_failed());
    assert!(io.qpair.is_failed());
    assert_eq!(done.statuses(), vec![Status::aborted_by_request()]);
    assert!(matches!(
        io.ns.read(&io.qpair, buf.vaddr(), 0, 1, IoFlags::empty(), |_| {}),
        Err(Error::ControllerFailed)
    ));
    assert!(matches!(io.ctrlr.reset(), Err(Error::ControllerFailed)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn written_data_reads_back(lba in 0u64..4096, count in 1u32..600, seed in any::<u8>()) {
        let io = setup(SimConfig::default());
        let len = count as usize * 512;
        let data = pattern(len, seed);
        let src = Buffer::new(&io.plat, len);
        src.fill(&data);
        prop_assert!(io.write(src.vaddr(), lba, count).is_success());

        let dst = Buffer::new(&io.plat, len);
        prop_assert!(io.read(dst.vaddr(), lba, count).is_success());
        prop_assert_eq!(dst.contents(), data);
    }
}
