//! Hot-path allocation discipline: `process` must not allocate.
//!
//! The counting allocator wraps the system allocator and counts every
//! allocation while armed. This file holds a single test so no sibling
//! test thread can allocate inside the armed window.

use cortex_rt::plugin::{Dtype, KernelConfig, Registry, ABI_VERSION};
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static ARMED: AtomicBool = AtomicBool::new(false);
static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

struct CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if ARMED.load(Ordering::Relaxed) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ARMED.load(Ordering::Relaxed) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static ALLOC: CountingAlloc = CountingAlloc;

#[test]
fn test_process_allocates_nothing_after_init() {
    let registry = Registry::builtin();
    let window = 160u32;
    let channels = 64u32;

    // Baseline needs its state blob; build it before arming.
    let cfg = KernelConfig {
        abi_version: ABI_VERSION,
        fs: 160.0,
        window,
        hop: 80,
        channels,
        dtype: Dtype::F32,
        in_place: false,
        params: "",
        calibration: None,
    };
    let training = vec![vec![0.5f32; (window * channels) as usize]; 2];
    let (state, _) = registry.calibrate("baseline", &cfg, &training).unwrap();
    let mut calibrated = cfg;
    calibrated.calibration = Some(&state);

    let mut instances = vec![
        ("noop", registry.load("noop", &cfg).unwrap()),
        ("car", registry.load("car", &cfg).unwrap()),
        ("decim", registry.load("decim", &cfg).unwrap()),
        ("baseline", registry.load("baseline", &calibrated).unwrap()),
    ];

    let input: Vec<f32> = (0..(window * channels) as usize)
        .map(|i| (i as f32).sin())
        .collect();

    for (name, instance) in &mut instances {
        let mut output = vec![0f32; instance.output_len()];
        // One warm call outside the armed window.
        instance.kernel.process(&input, &mut output).unwrap();

        ALLOCATIONS.store(0, Ordering::SeqCst);
        ARMED.store(true, Ordering::SeqCst);
        for _ in 0..100 {
            instance.kernel.process(&input, &mut output).unwrap();
        }
        ARMED.store(false, Ordering::SeqCst);
        assert_eq!(
            ALLOCATIONS.load(Ordering::SeqCst),
            0,
            "kernel {name} allocated in process()"
        );
    }
}
