//! Small end-to-end exercise of `binder-alloc` against a real
//! `SystemPageAllocator`, outside of `cargo test`.
//!
//! Run with `RUST_LOG=trace cargo run --bin alloc-demo` to see the
//! allocator's lifecycle, allocation and free logging.

use binder_alloc::{BinderAlloc, BinderAllocConfig, MapArea};

fn main() {
    env_logger::init();

    let alloc = BinderAlloc::init(BinderAllocConfig::new(std::process::id()));
    alloc.mmap(MapArea { size: 16 * 1024 }).expect("mmap");

    let a = alloc.new_buf(64, 0, 0, false).expect("alloc a");
    let b = alloc.new_buf(128, 16, 0, true).expect("alloc b");

    let payload = b"hello from the demo binary\0\0\0\0\0";
    alloc.copy_to_buffer(a.handle, 0, payload).expect("copy in");

    let mut out = vec![0u8; payload.len()];
    alloc.copy_from_buffer(a.handle, 0, &mut out).expect("copy out");
    assert_eq!(&out[..], &payload[..]);

    println!("live buffers before free: {}", alloc.live_buffer_count());
    println!("resident pages before free: {}", alloc.resident_page_count());

    alloc.free_buf(a.handle);
    alloc.free_buf(b.handle);

    println!("live buffers after free: {}", alloc.live_buffer_count());
    println!("resident pages after free: {}", alloc.resident_page_count());

    let leaked = alloc.deferred_release();
    println!("buffers outstanding at teardown: {}", leaked.len());
}
