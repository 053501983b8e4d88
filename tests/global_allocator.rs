//! `Allocator` installed as the global allocator of this test binary.

use std::alloc::{GlobalAlloc, Layout};

use chunkmalloc::Allocator;

#[global_allocator]
static ALLOC: Allocator = Allocator;

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Line([u8; 64]);

#[test]
fn collections_run_on_the_heap() {
  let mut v = Vec::new();
  for i in 0..100_000u64 {
    v.push(i);
  }
  assert_eq!(v.iter().sum::<u64>(), 100_000 * 99_999 / 2);

  let s: String = (0..1000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
  assert_eq!(s.len(), 1000);
  assert!(s.starts_with("abc"));

  assert!(!chunkmalloc::snapshot().arenas.is_empty());
}

#[test]
fn over_aligned_vectors_past_the_big_tier() {
  let lines = vec![Line([7; 64]); 40_000];
  assert_eq!(lines.as_ptr() as usize % 64, 0);
  assert!(lines.iter().all(|l| l.0.iter().all(|&b| b == 7)));

  let boxed = Box::new(Line([1; 64]));
  assert_eq!(&*boxed as *const Line as usize % 64, 0);
}

#[test]
fn zeroed_allocations() {
  let big = vec![0u64; 300_000];
  assert!(big.iter().all(|&x| x == 0));

  for align in [8, 256] {
    let layout = Layout::from_size_align(3000, align).unwrap();
    unsafe {
      let dirty = ALLOC.alloc(layout);
      dirty.write_bytes(0xC3, 3000);
      ALLOC.dealloc(dirty, layout);

      let p = ALLOC.alloc_zeroed(layout);
      assert_eq!(p as usize % align, 0);
      assert!((0..3000).all(|i| *p.add(i) == 0));
      ALLOC.dealloc(p, layout);
    }
  }
}

#[test]
fn over_aligned_realloc_moves_and_keeps_the_prefix() {
  let layout = Layout::from_size_align(100, 128).unwrap();
  unsafe {
    let p = ALLOC.alloc(layout);
    assert_eq!(p as usize % 128, 0);
    for i in 0..100 {
      p.add(i).write(i as u8);
    }

    let q = ALLOC.realloc(p, layout, 5000);
    assert!(!q.is_null());
    assert_eq!(q as usize % 128, 0);
    assert!((0..100).all(|i| *q.add(i) == i as u8));
    ALLOC.dealloc(q, Layout::from_size_align(5000, 128).unwrap());
  }
}

#[test]
fn plain_realloc_keeps_the_prefix() {
  let mut v: Vec<u8> = (0..=255).collect();
  v.reserve(1 << 21);
  assert!(v.iter().enumerate().all(|(i, &b)| b == i as u8));
}
