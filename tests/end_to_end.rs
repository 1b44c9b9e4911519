//! Whole-pipeline tests: source text through the compiler and verifier and
//! into the VM against a mock bus.

use busscript::{
    compile, image::SECT_CODE, verifier, ImageInfo, MemoryHost, MockBus, Packet, Vm, VmConfig,
};

use std::{
    cell::RefCell,
    io::{self, Write},
    rc::Rc,
};

fn build(src: &str) -> Vec<u8> {
    let mut host = MemoryHost::default();
    let out = compile(&mut host, src);
    assert!(out.success, "{:?}", out.errors);
    out.binary
}

fn load(src: &str, bus: MockBus) -> Vm<MockBus> {
    Vm::load(bus, &build(src), VmConfig::default()).unwrap()
}

/// `print` sink that the test can still read after handing it to the VM.
#[derive(Clone, Default)]
struct SharedSink(Rc<RefCell<Vec<u8>>>);

impl SharedSink {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn compiled_images_verify() {
    let sources = [
        "",
        "var a = 1; var b = a * -2;",
        "function clamp(v, lo, hi) {\n\
         \x20 if (v < lo) { return lo; }\n\
         \x20 if (hi < v) { return hi; }\n\
         \x20 return v;\n\
         }\n\
         var x = clamp(7, 0, 5);",
        "var b = roles.button(); var n = 0;\n\
         b.down.sub(() => { n = n + 1; });\n\
         b.up.sub(() => { n = n - 1; });",
        "var t = roles.temperature();\n\
         t.temperature.onChange(0.5, () => { print(\"moved\"); });",
        "every(1, () => { upload(format(\"tick\"), 1); });",
        "var h = roles.humidity(); var v = h.humidity.read();\n\
         panic(12);",
    ];

    for src in &sources {
        let mut host = MemoryHost::default();
        let out = compile(&mut host, src);
        assert!(out.success, "{:?}: {:?}", src, out.errors);
        verifier::verify(&out.binary).unwrap();
        assert!(host.files.contains_key("prog.img"));
        assert!(host.files.contains_key("prog-dbg.json"));
    }
}

#[test]
fn image_layout_holds() {
    let binary = build("var b = roles.button(); var n = 0.25; print(\"n={0}\", n);");
    let info = ImageInfo::parse(&binary).unwrap();

    let mut expected = 64 + 6 * 8;
    for section in &info.sections {
        assert_eq!(section.start, expected);
        expected = section.end();
    }
    assert_eq!(expected, binary.len());

    // the entry function takes no arguments
    assert_eq!(info.functions[0].num_args, 0);
    assert_eq!(info.floats, vec![0.25]);
    assert_eq!(info.role_classes, vec![0x1473_a263]);
}

#[test]
fn corrupted_code_fails_verification() {
    let mut binary = build("var a = 1; var b = a + 2;");
    let info = ImageInfo::parse(&binary).unwrap();

    // overwrite the first instruction with `r0 := r0 + r1`; neither
    // register has been written yet
    let offset = info.sections[SECT_CODE].start;
    let bad = (6u16 << 12) | (1 << 8) | 1;
    binary[offset..offset + 2].copy_from_slice(&bad.to_le_bytes());

    assert!(verifier::verify(&binary).is_err());
}

#[test]
fn wide_indices_roundtrip() {
    // enough globals that stores need a prefixed index
    let mut src = String::new();
    for i in 0..70 {
        src.push_str(&format!("var g{} = {};\n", i, i));
    }
    let binary = build(&src);
    verifier::verify(&binary).unwrap();

    let mut vm = Vm::load(MockBus::new(), &binary, VmConfig::default()).unwrap();
    vm.run();
    assert_eq!(vm.global(0), Some(0.0));
    assert_eq!(vm.global(69), Some(69.0));
}

#[test]
fn print_reaches_the_sink() {
    let sink = SharedSink::default();
    let mut vm = load("var n = 2; print(\"n={0} m={1}\", n, n * 2);", MockBus::new());
    vm.set_sink(Box::new(sink.clone()));
    vm.run();
    assert_eq!(sink.contents(), "n=2 m=4\n");
}

#[test]
fn button_counter_scenario() {
    let bus = MockBus::new()
        .with_service(0xb007, 1, 0x1473_a263)
        .with_service(0x1ab5, 2, 0x1cab_054c);
    let mut vm = load(
        "var b = roles.button();\n\
         var l = roles.lightBulb();\n\
         var n = 0;\n\
         b.down.sub(() => {\n\
         \x20 n = n + 1;\n\
         \x20 l.brightness.write(1);\n\
         });",
        bus,
    );
    vm.run();

    for _ in 0..2 {
        vm.process_packet(&Packet::event(0xb007, 1, 0x1, vec![]));
    }
    assert_eq!(vm.global(0), Some(2.0));

    // an unrelated event on the same device leaves the counter alone
    vm.process_packet(&Packet::event(0xb007, 1, 0x2, vec![]));
    assert_eq!(vm.global(0), Some(2.0));

    let sets = &vm.bus().sets;
    assert_eq!(sets.len(), 2);
    assert_eq!(sets[0].0, 0x1ab5);
    assert_eq!(sets[0].2, 0x1);
    assert_eq!(sets[0].3, 0xffffu16.to_le_bytes().to_vec());
}

#[test]
fn periodic_read_and_upload() {
    let mut bus = MockBus::new().with_service(0x7e47, 1, 0x1421_bac7);
    let raw = (21.5f64 * 1024.0) as i32;
    bus.registers
        .insert((0x7e47, 1, 0x101), raw.to_le_bytes().to_vec());

    let mut vm = load(
        "var t = roles.temperature();\n\
         every(1, () => {\n\
         \x20 var v = t.temperature.read();\n\
         \x20 upload(format(\"temp {0}\", v), v);\n\
         });",
        bus,
    );
    vm.run();
    assert!(vm.bus().uploads.is_empty());

    vm.bus_mut().now = 1001;
    vm.timer_fired();
    let uploads = &vm.bus().uploads;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "temp 21.5");
    assert_eq!(uploads[0].1, vec![21.5]);

    vm.bus_mut().now = 2002;
    vm.timer_fired();
    assert_eq!(vm.bus().uploads.len(), 2);
}

#[test]
fn background_starts_do_not_stack() {
    let mut vm = load(
        "var n = 0;\n\
         function arm() { every(1, () => { n = n + 1; }); }\n\
         arm(); arm();",
        MockBus::new(),
    );
    vm.run();
    assert_eq!(vm.global(0), Some(0.0));

    vm.bus_mut().now = 1001;
    vm.timer_fired();
    // the second start found the ticker already running
    assert_eq!(vm.global(0), Some(1.0));
}

#[test]
fn pending_start_reruns_once() {
    let mut binary = build(
        "var n = 0;\n\
         function slow() { n = n + 1; wait(3); }\n\
         every(1, () => { slow(); });",
    );

    // retarget the handler's synchronous call into a background start
    // that keeps at most one pending rerun (call mode bits 6..8)
    let info = ImageInfo::parse(&binary).unwrap();
    let code = &info.sections[SECT_CODE];
    let mut off = code.start;
    let mut patched = false;
    while off < code.end() {
        let word = u16::from_le_bytes([binary[off], binary[off + 1]]);
        if word >> 12 == 10 && (word >> 6) & 3 == 0 {
            let word = word | (3 << 6);
            binary[off..off + 2].copy_from_slice(&word.to_le_bytes());
            patched = true;
            break;
        }
        off += 2;
    }
    assert!(patched, "no synchronous call found to patch");

    let mut vm = Vm::load(MockBus::new(), &binary, VmConfig::default()).unwrap();
    vm.run();

    // first tick spawns `slow`; the next two ticks find it still waiting
    // and collapse into a single pending rerun
    for now in [1001, 2002, 3003] {
        vm.bus_mut().now = now;
        vm.timer_fired();
    }
    assert_eq!(vm.global(0), Some(1.0));

    // `slow` wakes, returns, and runs exactly once more
    vm.bus_mut().now = 4001;
    vm.timer_fired();
    assert_eq!(vm.global(0), Some(2.0));
}

#[test]
fn const_registers_skip_the_refresh_window() {
    let mut bus = MockBus::new()
        .with_service(0xacc, 1, 0x1f14_0409)
        .with_service(0x7e47, 2, 0x1421_bac7);
    bus.registers
        .insert((0xacc, 1, 0x180), (8u32 << 20).to_le_bytes().to_vec());
    bus.register_times.insert((0xacc, 1, 0x180), 0);
    let temp = ((21.5f64 * 1024.0) as i32).to_le_bytes().to_vec();
    bus.registers.insert((0x7e47, 2, 0x101), temp.clone());
    bus.register_times.insert((0x7e47, 2, 0x101), 0);
    bus.now = 1000;

    let mut vm = load(
        "var a = roles.accelerometer();\n\
         var t = roles.temperature();\n\
         var m = a.maxForce.read();\n\
         var v = t.temperature.read();",
        bus,
    );
    vm.run();

    // the constant register is served from the stale cache, the reading
    // register goes back to the device
    assert_eq!(vm.global(0), Some(8.0));
    assert_ne!(vm.global(1), Some(21.5));
    assert_eq!(vm.bus().queries, vec![(0x7e47, 2, 0x101)]);

    vm.process_packet(&Packet::register_report(0x7e47, 2, 0x101, temp));
    assert_eq!(vm.global(1), Some(21.5));
}

#[test]
fn disconnect_unbinds_and_announce_rebinds() {
    let bus = MockBus::new().with_service(0xaaaa, 1, 0x1473_a263);
    let mut vm = load(
        "var b = roles.button(); var n = 0; b.down.sub(() => { n = n + 1; });",
        bus,
    );
    vm.run();
    vm.process_packet(&Packet::event(0xaaaa, 1, 0x1, vec![]));
    assert_eq!(vm.global(0), Some(1.0));

    vm.bus_mut().drop_device(0xaaaa);
    vm.device_disconnected(0xaaaa);

    // packets from the old binding are ignored now
    vm.process_packet(&Packet::event(0xaaaa, 1, 0x1, vec![]));
    assert_eq!(vm.global(0), Some(1.0));

    // a replacement device shows up and takes over the role
    vm.bus_mut().services.push((0xbbbb, 4, 0x1473_a263));
    vm.self_announce();
    vm.process_packet(&Packet::event(0xbbbb, 4, 0x1, vec![]));
    assert_eq!(vm.global(0), Some(2.0));
}

#[test]
fn debug_info_names_things() {
    let mut host = MemoryHost::default();
    let out = compile(
        &mut host,
        "var b = roles.button(); var total = 0;\n\
         function bump(by) { total = total + by; }\n\
         b.down.sub(() => { bump(1); });",
    );
    assert!(out.success, "{:?}", out.errors);

    assert_eq!(out.dbg.globals, vec!["total".to_string()]);
    assert_eq!(out.dbg.roles.len(), 1);
    assert_eq!(out.dbg.roles[0].name, "b");
    assert_eq!(out.dbg.roles[0].service_class, 0x1473_a263);
    assert!(out.dbg.functions.iter().any(|f| f.name == "bump"));
    assert!(out
        .dbg
        .functions
        .iter()
        .all(|f| f.srcmap.iter().all(|&(line, _, _)| line >= 1)));
}
