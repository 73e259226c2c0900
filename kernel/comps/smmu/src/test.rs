// SPDX-License-Identifier: MPL-2.0

use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::thread;

use crate::{
    cmdq::Command,
    config::{DomainOptions, FreePolicy, SmmuConfig},
    domain::IommuDomain,
    event::{EventId, EventRecord, FaultAccess, FaultObserver, FaultReport},
    hal::SecureAttestor,
    mm::{BLOCK_SIZE, PhysSegment},
    page_table::IommuProt,
    prelude::*,
    registers::{CR0, Control, GERROR, GERRORN, GlobalErrors},
    sim::SimEnv,
    stream::{Privilege, StreamConfig},
};

const WINDOW: Range<Daddr> = 0x1000..0x4000_0000;

fn rw() -> IommuProt {
    IommuProt::READ | IommuProt::WRITE
}

fn create_domain(env: &SimEnv, options: &DomainOptions) -> Arc<IommuDomain> {
    env.smmu.create_domain(options).unwrap()
}

fn scatter_list() -> [PhysSegment; 3] {
    [
        PhysSegment::new(0x8000_0000, 0x1000),
        PhysSegment::new(0x9000_0000, 0x2000),
        PhysSegment::new(0xa000_0000, 0x1000),
    ]
}

#[derive(Default)]
struct FaultLog(spin::Mutex<Vec<FaultReport>>);

impl FaultObserver for FaultLog {
    fn on_fault(&self, report: &FaultReport) {
        self.0.lock().push(report.clone());
    }
}

#[derive(Default)]
struct MockAttestor {
    protected: spin::Mutex<Vec<(Range<Daddr>, Vec<PhysSegment>)>>,
    unprotected: spin::Mutex<Vec<Range<Daddr>>>,
    reject: AtomicBool,
}

impl SecureAttestor for MockAttestor {
    fn protect(&self, iova: Range<Daddr>, segments: &[PhysSegment]) -> Result<()> {
        if self.reject.load(Ordering::Relaxed) {
            return Err(Error::AttestationFailed);
        }
        self.protected.lock().push((iova, segments.to_vec()));
        Ok(())
    }

    fn unprotect(&self, iova: Range<Daddr>) -> Result<()> {
        self.unprotected.lock().push(iova);
        Ok(())
    }
}

#[test]
fn probe_enables_unit() {
    let env = SimEnv::boot();

    let cr0 = Control::from_bits_truncate(env.hw.reg(CR0) as u32);
    assert_eq!(cr0, Control::SMMUEN | Control::EVTQEN | Control::CMDQEN);
    assert!(!env.smmu.is_disabled());
    assert_eq!(
        env.hw.commands()[..3],
        [Command::CfgiAll, Command::TlbiNsnhAll, Command::Sync]
    );
    assert_eq!(env.hw.stream_entry(0).config(), Some(StreamConfig::Abort));
    assert_eq!(env.hw.stream_entry(255).config(), Some(StreamConfig::Abort));
}

#[test]
fn unbound_streams_bypass() {
    let env = SimEnv::boot_with(SmmuConfig {
        bypass_unbound: true,
        ..SmmuConfig::default()
    });
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));

    assert_eq!(env.hw.stream_entry(5).config(), Some(StreamConfig::Bypass));
    env.smmu.attach(5, &domain).unwrap();
    env.smmu.detach(5).unwrap();
    assert_eq!(env.hw.stream_entry(5).config(), Some(StreamConfig::Bypass));
}

#[test]
fn scatter_list_maps_contiguously() {
    let env = SimEnv::boot();
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));
    env.smmu.attach(1, &domain).unwrap();

    let iova = domain.map_scatter(&scatter_list(), rw(), 0).unwrap();
    assert_eq!(domain.iova_to_phys(iova), Some(0x8000_0000));
    assert_eq!(domain.iova_to_phys(iova + 0x1000), Some(0x9000_0000));
    assert_eq!(domain.iova_to_phys(iova + 0x2fff), Some(0x9000_1fff));
    assert_eq!(domain.iova_to_phys(iova + 0x3000), Some(0xa000_0000));
    assert_eq!(domain.iova_to_phys(iova + 0x4000), None);

    let stats = domain.stats();
    assert_eq!(stats.nr_live_ranges, 1);
    assert_eq!(stats.free_size, WINDOW.len() - 0x4000);

    env.hw.clear_commands();
    domain.unmap(iova, 0x4000).unwrap();
    assert_eq!(domain.iova_to_phys(iova), None);
    let cmds = env.hw.commands();
    for i in 0..4 {
        assert!(cmds.contains(&Command::TlbiNhVa {
            asid: domain.asid(),
            addr: iova + i * PAGE_SIZE,
            leaf: true,
        }));
    }
    assert_eq!(cmds.last(), Some(&Command::Sync));
    assert_eq!(domain.stats().free_size, WINDOW.len());
}

#[test]
fn scatter_list_in_large_window() {
    let env = SimEnv::boot();
    let window = 0x1000..0x2_0000_0000;
    let domain = create_domain(&env, &DomainOptions::new(window.clone()));
    // One root, 8 level-2 tables and 4096 leaf tables.
    assert_eq!(domain.stats().nr_table_pages, 4105);
    env.smmu.attach(1, &domain).unwrap();

    let iova = domain.map_scatter(&scatter_list(), rw(), 0).unwrap();
    assert!(window.contains(&iova));
    assert_eq!(domain.iova_to_phys(iova + 0x1000), Some(0x9000_0000));
    let mapped = (0..5)
        .filter(|i| domain.iova_to_phys(iova + i * PAGE_SIZE).is_some())
        .count();
    assert_eq!(mapped, 4);
    assert_eq!(domain.stats().free_size, window.len() - 0x4000);

    domain.unmap(iova, 0x4000).unwrap();
    assert_eq!(domain.stats().free_size, window.len());
}

#[test]
fn invalid_scatter_lists() {
    let env = SimEnv::boot();
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));

    assert_eq!(domain.map_scatter(&[], rw(), 0), Err(Error::InvalidArgs));
    let unaligned = [PhysSegment::new(0x8000_0800, 0x1000)];
    assert_eq!(domain.map_scatter(&unaligned, rw(), 0), Err(Error::InvalidArgs));
    let empty = [PhysSegment::new(0x8000_0000, 0)];
    assert_eq!(domain.map_scatter(&empty, rw(), 0), Err(Error::InvalidArgs));
    assert_eq!(
        domain.map_scatter(&scatter_list(), rw(), 5),
        Err(Error::InvalidArgs)
    );
    assert_eq!(domain.stats().nr_live_ranges, 0);
}

#[test]
fn contiguous_mappings() {
    let env = SimEnv::boot();
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));

    let block = domain.map(None, 0x4000_0000, BLOCK_SIZE, rw()).unwrap();
    assert_eq!(block % BLOCK_SIZE, 0);
    assert_eq!(domain.iova_to_phys(block + 0x1234), Some(0x4000_1234));
    // The block replaced a leaf table, whose walks were invalidated.
    assert!(env.hw.commands().contains(&Command::TlbiNhVa {
        asid: domain.asid(),
        addr: block,
        leaf: false,
    }));

    assert_eq!(
        domain.map(Some(0x10_0000), 0x8000_0000, 0x1800, rw()),
        Ok(0x10_0000)
    );
    assert_eq!(domain.iova_to_phys(0x10_1000), Some(0x8000_1000));
    assert_eq!(
        domain.map(Some(0x10_1000), 0x9000_0000, 0x1000, rw()),
        Err(Error::Overlap)
    );
    assert_eq!(
        domain.map(None, 0x8000_0800, 0x1000, rw()),
        Err(Error::InvalidArgs)
    );
    assert_eq!(domain.map(None, 0x8000_0000, 0, rw()), Err(Error::InvalidArgs));

    domain.unmap(0x10_0000, 0x1800).unwrap();
    assert_eq!(domain.unmap(0x10_0000, 0x1800), Err(Error::DoubleFree));
    domain.unmap(block, BLOCK_SIZE).unwrap();
    assert_eq!(domain.stats().nr_live_ranges, 0);
}

#[test]
fn cancelled_map_gives_range_back() {
    let env = SimEnv::boot();
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));

    env.hal.signal_after(1);
    let result = domain.map(None, 0x8000_0000, 4 * PAGE_SIZE, rw());
    env.hal.clear_signal();

    assert_eq!(result, Err(Error::Interrupted));
    let stats = domain.stats();
    assert_eq!(stats.nr_live_ranges, 0);
    assert_eq!(stats.free_size, WINDOW.len());
    // The page mapped before the signal was invalidated.
    assert!(env.hw.commands().contains(&Command::TlbiNhVa {
        asid: domain.asid(),
        addr: WINDOW.start,
        leaf: true,
    }));
    assert_eq!(domain.iova_to_phys(WINDOW.start), None);
}

#[test]
fn attach_and_detach() {
    let env = SimEnv::boot();
    let smmu = &env.smmu;
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));

    smmu.attach(1, &domain).unwrap();
    assert_eq!(
        env.hw.stream_entry(1).config(),
        Some(StreamConfig::Translate {
            cd: domain.cd_paddr(),
            cd_cacheable: true,
            privilege: Privilege::Inherit,
        })
    );
    assert!(env.hw.commands().contains(&Command::CfgiSte { sid: 1, leaf: true }));
    assert!(Arc::ptr_eq(&smmu.domain_of(1).unwrap(), &domain));

    env.hw.clear_commands();
    smmu.attach(1, &domain).unwrap();
    assert!(env.hw.commands().is_empty());

    assert_eq!(smmu.attach(2, &domain), Err(Error::Busy));
    assert_eq!(env.hw.stream_entry(2).config(), Some(StreamConfig::Abort));
    assert_eq!(smmu.attach(256, &domain), Err(Error::UnknownDevice));
    assert_eq!(smmu.detach(256), Err(Error::UnknownDevice));

    smmu.detach(1).unwrap();
    assert_eq!(env.hw.stream_entry(1).config(), Some(StreamConfig::Abort));
    assert!(smmu.domain_of(1).is_none());
    assert!(domain.devices().is_empty());
    smmu.attach(2, &domain).unwrap();
}

#[test]
fn shared_domains_and_moves() {
    let env = SimEnv::boot();
    let smmu = &env.smmu;
    let mut options = DomainOptions::new(WINDOW);
    options.shared(true).privilege(Privilege::Privileged);
    let a = create_domain(&env, &options);
    let b = create_domain(&env, &options);
    assert_ne!(a.asid(), b.asid());

    smmu.attach(1, &a).unwrap();
    smmu.attach(2, &a).unwrap();
    smmu.attach(3, &a).unwrap();
    assert_eq!(a.devices(), vec![1, 2, 3]);

    smmu.attach(3, &b).unwrap();
    assert_eq!(a.devices(), vec![1, 2]);
    assert_eq!(b.devices(), vec![3]);
    assert_eq!(
        env.hw.stream_entry(3).config(),
        Some(StreamConfig::Translate {
            cd: b.cd_paddr(),
            cd_cacheable: true,
            privilege: Privilege::Privileged,
        })
    );

    smmu.set_bypass(2).unwrap();
    assert_eq!(env.hw.stream_entry(2).config(), Some(StreamConfig::Bypass));
    assert_eq!(a.devices(), vec![1]);
    smmu.set_abort(2).unwrap();
    assert_eq!(env.hw.stream_entry(2).config(), Some(StreamConfig::Abort));
}

#[test]
fn failed_attach_leaves_stream_unbound() {
    let env = SimEnv::boot_with(SmmuConfig {
        poll_timeout: Duration::from_millis(30),
        ..SmmuConfig::default()
    });
    let smmu = &env.smmu;
    let mut options = DomainOptions::new(WINDOW);
    options.shared(true);
    let a = create_domain(&env, &options);
    let b = create_domain(&env, &options);
    smmu.attach(1, &a).unwrap();

    env.hw.pause();
    assert_eq!(smmu.attach(1, &b), Err(Error::Timeout));
    env.hw.resume();

    // Neither the hardware nor the driver keeps the old binding.
    assert_eq!(env.hw.stream_entry(1).config(), None);
    assert!(smmu.domain_of(1).is_none());
    assert!(a.devices().is_empty());
    assert!(b.devices().is_empty());

    smmu.attach(1, &b).unwrap();
    assert!(Arc::ptr_eq(&smmu.domain_of(1).unwrap(), &b));
    assert_eq!(b.devices(), vec![1]);
}

#[test]
fn failed_detach_leaves_stream_unbound() {
    let env = SimEnv::boot_with(SmmuConfig {
        poll_timeout: Duration::from_millis(30),
        ..SmmuConfig::default()
    });
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));
    env.smmu.attach(4, &domain).unwrap();

    env.hw.pause();
    assert_eq!(env.smmu.detach(4), Err(Error::Timeout));
    env.hw.resume();

    assert_eq!(env.hw.stream_entry(4).config(), None);
    assert!(env.smmu.domain_of(4).is_none());
    assert!(domain.devices().is_empty());
}

#[test]
fn faults_are_handled_during_attach() {
    let env = SimEnv::boot_with(SmmuConfig {
        poll_timeout: Duration::from_millis(500),
        ..SmmuConfig::default()
    });
    let log = Arc::new(FaultLog::default());
    env.smmu.register_fault_observer(log.clone());
    let a = create_domain(&env, &DomainOptions::new(WINDOW));
    let b = create_domain(&env, &DomainOptions::new(WINDOW));
    env.smmu.attach(7, &a).unwrap();
    env.hw.inject_event(EventRecord::new_fault(
        EventId::Translation,
        7,
        0x10_0000,
        FaultAccess::Read,
    ));

    env.hw.pause();
    thread::scope(|s| {
        let attach = s.spawn(|| env.smmu.attach(3, &b));
        thread::sleep(Duration::from_millis(20));

        assert_eq!(env.smmu.handle_event_irq(), 1);
        // The attach is still waiting for the stalled unit.
        assert!(!attach.is_finished());
        assert_eq!(attach.join().unwrap(), Err(Error::Timeout));
    });
    env.hw.resume();

    let reports = log.0.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].asid, Some(a.asid()));
}

#[test]
fn foreign_domain_is_rejected() {
    let env = SimEnv::boot();
    let other = SimEnv::boot();
    let domain = create_domain(&other, &DomainOptions::new(WINDOW));

    assert_eq!(env.smmu.attach(1, &domain), Err(Error::InvalidArgs));
}

#[test]
fn shared_buffers_are_deduplicated() {
    let env = SimEnv::boot();
    let mut options = DomainOptions::new(WINDOW);
    options.shared(true);
    let domain = create_domain(&env, &options);
    env.smmu.attach(1, &domain).unwrap();
    env.smmu.attach(2, &domain).unwrap();

    let first = domain.map_shared_buffer(42, &scatter_list(), rw()).unwrap();
    let second = domain.map_shared_buffer(42, &scatter_list(), rw()).unwrap();
    assert_eq!(first, second);
    assert_eq!(domain.shared_buffer_refcount(42), Some(2));
    let stats = domain.stats();
    assert_eq!(stats.nr_shared_buffers, 1);
    assert_eq!(stats.nr_live_ranges, 1);

    assert_eq!(domain.unmap(first, 0x4000), Err(Error::Busy));

    domain.unmap_shared_buffer(42).unwrap();
    assert_eq!(domain.shared_buffer_refcount(42), Some(1));
    assert_eq!(domain.iova_to_phys(first + 0x1000), Some(0x9000_0000));

    domain.unmap_shared_buffer(42).unwrap();
    assert_eq!(domain.shared_buffer_refcount(42), None);
    assert_eq!(domain.iova_to_phys(first), None);
    assert_eq!(domain.stats().nr_live_ranges, 0);
    assert_eq!(domain.unmap_shared_buffer(42), Err(Error::NotMapped));
}

#[test]
fn failed_shared_buffer_unmap_can_be_retried() {
    let env = SimEnv::boot_with(SmmuConfig {
        poll_timeout: Duration::from_millis(30),
        ..SmmuConfig::default()
    });
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));
    env.smmu.attach(1, &domain).unwrap();
    let iova = domain.map_shared_buffer(9, &scatter_list(), rw()).unwrap();

    env.hw.pause();
    assert_eq!(domain.unmap_shared_buffer(9), Err(Error::Timeout));
    env.hw.resume();
    assert_eq!(domain.shared_buffer_refcount(9), Some(1));
    assert_eq!(domain.iova_to_phys(iova), None);
    assert_eq!(domain.stats().nr_live_ranges, 1);

    env.hw.clear_commands();
    domain.unmap_shared_buffer(9).unwrap();
    // The cleared entries are invalidated before the range is given back.
    let cmds = env.hw.commands();
    for i in 0..4 {
        assert!(cmds.contains(&Command::TlbiNhVa {
            asid: domain.asid(),
            addr: iova + i * PAGE_SIZE,
            leaf: true,
        }));
    }
    assert_eq!(domain.shared_buffer_refcount(9), None);
    assert_eq!(domain.stats().nr_live_ranges, 0);
}

#[test]
fn deferred_unmaps_are_batched() {
    let env = SimEnv::boot();
    let window = 0x1000..0x10_1000;
    let mut options = DomainOptions::new(window.clone());
    // 256 pages, so two pending pages close an epoch.
    options.free_policy(FreePolicy::Deferred {
        watermark_permille: 10,
    });
    let domain = create_domain(&env, &options);
    let asid = domain.asid();

    let a = domain.map(None, 0x8000_0000, PAGE_SIZE, rw()).unwrap();
    let b = domain.map(None, 0x8000_1000, PAGE_SIZE, rw()).unwrap();

    env.hw.clear_commands();
    domain.unmap(a, PAGE_SIZE).unwrap();
    assert!(env.hw.commands().is_empty());
    assert_eq!(domain.iova_to_phys(a), None);
    assert_eq!(domain.stats().pending_size, PAGE_SIZE);
    assert_eq!(env.hal.nr_queued_work(), 0);

    domain.unmap(b, PAGE_SIZE).unwrap();
    assert_eq!(env.hal.nr_queued_work(), 1);
    assert_eq!(domain.stats().pending_size, 2 * PAGE_SIZE);

    assert_eq!(env.hal.run_queued_work(), 1);
    assert!(env.hw.commands().contains(&Command::TlbiNhAsid { asid }));
    let stats = domain.stats();
    assert_eq!(stats.pending_size, 0);
    assert_eq!(stats.free_size, window.len());
    assert_eq!(env.hal.nr_queued_work(), 0);

    // A pending range of the same size is reused after a flush.
    let c = domain.map(None, 0x8000_2000, PAGE_SIZE, rw()).unwrap();
    domain.unmap(c, PAGE_SIZE).unwrap();
    env.hw.clear_commands();
    assert_eq!(domain.map(None, 0x8000_3000, PAGE_SIZE, rw()), Ok(c));
    assert!(env.hw.commands().contains(&Command::TlbiNhAsid { asid }));
    assert_eq!(domain.iova_to_phys(c), Some(0x8000_3000));

    let d = domain.map(None, 0x8000_4000, 2 * PAGE_SIZE, rw()).unwrap();
    domain.unmap(d, 2 * PAGE_SIZE).unwrap();
    domain.unmap(c, PAGE_SIZE).unwrap();
    assert_eq!(domain.reclaim_deferred(), Ok(3 * PAGE_SIZE));
    assert_eq!(domain.stats().free_size, window.len());
}

#[test]
fn protected_mappings_skip_header() {
    let env = SimEnv::boot();
    let attestor = Arc::new(MockAttestor::default());
    let mut options = DomainOptions::new(WINDOW);
    options.protected(attestor.clone());
    let domain = create_domain(&env, &options);
    assert!(domain.is_protected());

    let segments = [
        PhysSegment::new(0x8000_0000, 0x1000),
        PhysSegment::new(0x9000_0000, 0x3000),
    ];
    let iova = domain.map_scatter(&segments, rw(), 2).unwrap();
    assert_eq!(
        *attestor.protected.lock(),
        vec![(
            iova + 0x2000..iova + 0x4000,
            vec![PhysSegment::new(0x9000_1000, 0x2000)]
        )]
    );
    assert_eq!(domain.iova_to_phys(iova + 0x3000), Some(0x9000_2000));

    domain.unmap(iova, 0x4000).unwrap();
    assert_eq!(
        *attestor.unprotected.lock(),
        vec![iova + 0x2000..iova + 0x4000]
    );

    // A mapping made only of header pages is not registered.
    let header_only = domain.map_scatter(&segments, rw(), 4).unwrap();
    assert_eq!(attestor.protected.lock().len(), 1);
    domain.unmap(header_only, 0x4000).unwrap();

    attestor.reject.store(true, Ordering::Relaxed);
    assert_eq!(
        domain.map_scatter(&segments, rw(), 0),
        Err(Error::AttestationFailed)
    );
    assert_eq!(domain.stats().nr_live_ranges, 0);
    assert_eq!(domain.stats().free_size, WINDOW.len());

    attestor.reject.store(false, Ordering::Relaxed);
    let iova = domain.map_scatter(&segments, rw(), 0).unwrap();
    drop(domain);
    assert_eq!(
        attestor.unprotected.lock().last(),
        Some(&(iova..iova + 0x4000))
    );
}

#[test]
fn translation_faults_are_reported() {
    let env = SimEnv::boot();
    let log = Arc::new(FaultLog::default());
    env.smmu.register_fault_observer(log.clone());
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));
    env.smmu.attach(7, &domain).unwrap();
    let iova = domain.map(None, 0x8000_0000, 3 * PAGE_SIZE, rw()).unwrap();

    let fault = EventRecord::new_fault(EventId::Translation, 7, iova + 0x1010, FaultAccess::Write);
    env.hw.inject_event(fault);
    // Repeated records of a stuck device are dropped.
    env.hw.inject_event(fault);
    env.hw.inject_event(EventRecord::new_fault(
        EventId::Permission,
        9,
        0x5000,
        FaultAccess::Read,
    ));
    env.hw.inject_event(EventRecord::new_fault(
        EventId::CfgConflict,
        7,
        0,
        FaultAccess::Read,
    ));
    assert_eq!(env.smmu.handle_event_irq(), 3);
    assert_eq!(env.smmu.handle_event_irq(), 0);

    let reports = log.0.lock();
    assert_eq!(reports.len(), 2);

    let bound = &reports[0];
    assert_eq!(bound.event, EventId::Translation);
    assert_eq!(bound.stream_id, 7);
    assert_eq!(bound.iova, iova + 0x1010);
    assert_eq!(bound.access, FaultAccess::Write);
    assert_eq!(bound.asid, Some(domain.asid()));
    let ptes = bound.ptes.as_ref().unwrap();
    assert_eq!(ptes.walk.len(), 3);
    assert_eq!(ptes.neighbors.len(), 5);

    let unbound = &reports[1];
    assert_eq!(unbound.event, EventId::Permission);
    assert_eq!(unbound.access, FaultAccess::Read);
    assert_eq!(unbound.asid, None);
    assert_eq!(unbound.ptes, None);
}

#[test]
fn flush_range_checks_window() {
    let env = SimEnv::boot();
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));

    assert_eq!(domain.flush_range(0, PAGE_SIZE), Err(Error::OutOfRange));
    assert_eq!(
        domain.flush_range(WINDOW.end - PAGE_SIZE, 2 * PAGE_SIZE),
        Err(Error::OutOfRange)
    );

    env.hw.clear_commands();
    domain.flush_range(0x10_0000, 0x1800).unwrap();
    assert_eq!(
        env.hw.commands(),
        vec![
            Command::TlbiNhVa {
                asid: domain.asid(),
                addr: 0x10_0000,
                leaf: true,
            },
            Command::TlbiNhVa {
                asid: domain.asid(),
                addr: 0x10_1000,
                leaf: true,
            },
            Command::Sync,
        ]
    );
}

#[test]
fn command_errors_are_skipped() {
    let env = SimEnv::boot();
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));

    env.hw.clear_commands();
    let nr_syncs = env.hw.nr_syncs();
    env.hw.fail_next_command(1);
    domain.flush_all().unwrap();

    // The failed command was replaced by a CMD_SYNC.
    assert_eq!(env.hw.commands(), vec![Command::Sync, Command::Sync]);
    assert_eq!(env.hw.nr_syncs(), nr_syncs + 2);
    let active = (env.hw.reg(GERROR) ^ env.hw.reg(GERRORN)) as u32;
    assert_eq!(active & GlobalErrors::CMDQ_ERR.bits(), 0);
    assert!(!env.smmu.is_disabled());

    domain.flush_all().unwrap();
}

#[test]
fn service_failure_disables_unit() {
    let env = SimEnv::boot();
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));

    env.hw.trigger_service_failure();
    assert!(env.smmu.is_disabled());
    assert_eq!(env.hw.reg(CR0), 0);
    assert!(!env.smmu.handle_gerror_irq());

    assert_eq!(domain.flush_all(), Err(Error::DeviceDisabled));
    assert_eq!(
        env.smmu.create_domain(&DomainOptions::new(WINDOW)).err(),
        Some(Error::DeviceDisabled)
    );
}

#[test]
fn domain_drop_frees_asid() {
    let env = SimEnv::boot();
    let domain = create_domain(&env, &DomainOptions::new(WINDOW));
    let asid = domain.asid();
    assert_ne!(asid, 0);

    env.smmu.attach(1, &domain).unwrap();
    env.smmu.detach(1).unwrap();
    env.hw.clear_commands();
    drop(domain);
    assert!(env.hw.commands().contains(&Command::TlbiNhAsid { asid }));

    let domain = create_domain(&env, &DomainOptions::new(WINDOW));
    assert_eq!(domain.asid(), asid);
}

#[test]
fn table_budget_is_enforced() {
    let env = SimEnv::boot();
    let mut options = DomainOptions::new(WINDOW);
    options.max_table_pages(8);
    assert_eq!(
        env.smmu.create_domain(&options).err(),
        Some(Error::NoMemory)
    );

    let domain = create_domain(&env, &DomainOptions::new(WINDOW));
    assert_eq!(domain.asid(), 1);
    assert_eq!(domain.stats().nr_table_pages, 514);
}

#[test]
fn shutdown_detaches_everything() {
    let env = SimEnv::boot();
    let mut options = DomainOptions::new(WINDOW);
    options.shared(true);
    let domain = create_domain(&env, &options);
    env.smmu.attach(1, &domain).unwrap();
    env.smmu.attach(2, &domain).unwrap();

    env.smmu.shutdown();
    assert!(env.smmu.domain_of(1).is_none());
    assert!(env.smmu.domain_of(2).is_none());
    assert!(domain.devices().is_empty());
    assert_eq!(env.hw.stream_entry(1).config(), Some(StreamConfig::Abort));
    assert_eq!(env.hw.reg(CR0), 0);
    assert!(env.smmu.is_disabled());
}
