mod alloc {
    use std::alloc::{Layout, System};

    // buffers hand out raw slots and large boxes whose
    // lifetime is governed by generation reclaim, so poison
    // fresh and freed memory distinctly: a stale entry
    // reference or a use-after-reclaim reads as garbage
    // instead of happening to look like a live array
    const FRESH_POISON: u8 = 0xa1;
    const FREED_POISON: u8 = 0xde;

    #[global_allocator]
    static ALLOCATOR: PoisoningAlloc = PoisoningAlloc;

    #[derive(Default, Debug, Clone, Copy)]
    struct PoisoningAlloc;

    unsafe impl std::alloc::GlobalAlloc for PoisoningAlloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let ret = unsafe { System.alloc(layout) };
            assert_ne!(ret, std::ptr::null_mut());
            unsafe {
                std::ptr::write_bytes(ret, FRESH_POISON, layout.size());
            }
            ret
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe {
                std::ptr::write_bytes(ptr, FREED_POISON, layout.size());
                System.dealloc(ptr, layout)
            }
        }
    }
}

pub fn setup_logger() {
    use std::io::Write;
    use std::time::Instant;

    fn tn() -> String {
        std::thread::current()
            .name()
            .unwrap_or("unknown")
            .to_owned()
    }

    let start = Instant::now();

    let mut builder = env_logger::Builder::new();
    builder
        .format(move |buf, record| {
            writeln!(
                buf,
                "{:>8.3}s {:05} {:16} {:12} {}",
                start.elapsed().as_secs_f64(),
                record.level(),
                tn(),
                record.module_path().unwrap_or("?").split("::").last().unwrap(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}
