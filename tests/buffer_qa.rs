//! Buffer QA - writer/reader accounting across wraps
//!
//! Every scenario runs inside `leak_check`, which snapshots a fresh
//! `Registry` before and after and demands the live counts match.
//!
//! The `large_*` variants use buffers past 2^32 items. They touch tens of
//! GiB and are ignored by default:
//!   cargo test --release --test buffer_qa -- --ignored

use flowbuf::{Buffer, BufferError, LiveCounts, Registry};

/// Deterministic LCG, uniform in [0, 1)
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn leak_check(body: fn(&Registry, bool), large: bool) {
    let registry = Registry::new();
    let before = registry.live();

    body(&registry, large);

    assert_eq!(before, registry.live());
    assert_eq!(before, LiveCounts::default());
}

fn make(registry: &Registry, items: usize) -> Buffer {
    Buffer::builder(items, std::mem::size_of::<u64>())
        .registry(registry)
        .build()
        .unwrap()
}

const SMALL_ITEMS: usize = 4000 / 8;
const WRAP_ITEMS: usize = 64 * 1024 / 8;
const LARGE_ITEMS: usize = (i32::MAX as usize + 1) * 2;

// ----------------------------------------------------------------------------
// single writer, no readers

fn writer_only(registry: &Registry, large: bool) {
    let mut nitems = SMALL_ITEMS;
    if large {
        nitems += LARGE_ITEMS;
    }
    let mut buf = make(registry, nitems);
    assert_eq!(registry.live_buffers(), 1);

    let mut counter = 0u64;
    let mut last_sa = buf.space_available();
    assert!(last_sa > 0);

    for _ in 0..5 {
        let sa = buf.space_available();
        assert_eq!(last_sa, sa);
        last_sa = sa;

        for slot in buf.write_items::<u64>() {
            *slot = counter;
            counter += 1;
        }
        buf.update_write_pointer(sa);
    }
}

// ----------------------------------------------------------------------------
// single writer, single reader

fn single_reader(registry: &Registry, large: bool) {
    let mut nitems = SMALL_ITEMS;
    if large {
        nitems += LARGE_ITEMS;
    }
    let mut buf = make(registry, nitems);
    let mut r1 = buf.add_reader(0, None);
    assert_eq!(registry.live(), LiveCounts { buffers: 1, readers: 1 });

    let mut write_counter = 0u64;
    let mut read_counter = 0u64;

    // write 1/3 of buffer
    let sa = buf.space_available();
    assert!(sa > 0);
    for slot in &mut buf.write_items::<u64>()[..sa / 3] {
        *slot = write_counter;
        write_counter += 1;
    }
    buf.update_write_pointer(sa / 3);

    // write the next 1/3 (1/2 of what's left)
    let sa = buf.space_available();
    assert!(sa > 0);
    for slot in &mut buf.write_items::<u64>()[..sa / 2] {
        *slot = write_counter;
        write_counter += 1;
    }
    buf.update_write_pointer(sa / 2);

    // read half of it
    let ia = r1.items_available();
    assert_eq!(write_counter as usize, ia);
    for &v in &r1.read_items::<u64>()[..ia / 2] {
        assert_eq!(read_counter, v);
        read_counter += 1;
    }
    r1.update_read_pointer(ia / 2);

    // read the rest
    let ia = r1.items_available();
    for &v in r1.read_items::<u64>() {
        assert_eq!(read_counter, v);
        read_counter += 1;
    }
    r1.update_read_pointer(ia);
    assert_eq!(read_counter, write_counter);
}

// ----------------------------------------------------------------------------
// single writer, single reader: wrap-around

fn wraparound(registry: &Registry, large: bool) {
    let nitems = if large { LARGE_ITEMS } else { WRAP_ITEMS };
    let mut buf = make(registry, nitems);
    let mut r1 = buf.add_reader(0, None);

    let mut write_counter = 0u64;
    let mut read_counter = 0u64;

    // write 3/4 of the buffer
    let n = (buf.space_available() as f64 * 0.75) as usize;
    for slot in &mut buf.write_items::<u64>()[..n] {
        *slot = write_counter;
        write_counter += 1;
    }
    buf.update_write_pointer(n);

    // read it all
    let m = r1.items_available();
    assert_eq!(n, m);
    for &v in r1.read_items::<u64>() {
        assert_eq!(read_counter, v);
        read_counter += 1;
    }
    r1.update_read_pointer(m);

    // write as much as we can; this crosses the end of storage
    let n = buf.space_available();
    if !large {
        assert_eq!(buf.capacity(), nitems);
        assert_eq!(nitems - 1, n);
    }
    for slot in buf.write_items::<u64>() {
        *slot = write_counter;
        write_counter += 1;
    }
    buf.update_write_pointer(n);

    // and read it back in one contiguous window
    let m = r1.items_available();
    assert_eq!(n, m);
    for &v in r1.read_items::<u64>() {
        assert_eq!(read_counter, v);
        read_counter += 1;
    }
    r1.update_read_pointer(m);
    assert_eq!(read_counter, write_counter);
}

// ----------------------------------------------------------------------------
// single writer, N readers, randomized order and lengths

fn random_readers(registry: &Registry, large: bool) {
    const N: usize = 5;
    let nitems = if large { LARGE_ITEMS } else { WRAP_ITEMS };
    let mut buf = make(registry, nitems);
    let mut readers: Vec<_> = (0..N).map(|_| buf.add_reader(0, None)).collect();
    let mut read_counter = [0u64; N];
    let mut write_counter = 0u64;
    let mut random = Lcg::new(0x5eed);

    assert_eq!(registry.live_readers(), N);

    for _ in 0..1000 {
        // write some
        let n = (buf.space_available() as f64 * random.next_f64()) as usize;
        for slot in &mut buf.write_items::<u64>()[..n] {
            *slot = write_counter;
            write_counter += 1;
        }
        buf.update_write_pointer(n);

        // pick a random reader and drain it
        let r = (N as f64 * random.next_f64()) as usize;
        assert!(r < N);

        let reader = &mut readers[r];
        let m = reader.items_available();
        for &v in reader.read_items::<u64>() {
            assert_eq!(read_counter[r], v);
            read_counter[r] += 1;
        }
        reader.update_read_pointer(m);
    }

    for (reader, count) in readers.iter().zip(read_counter) {
        assert_eq!(reader.nitems_read(), count);
        assert_eq!(count + reader.items_available() as u64, write_counter);
    }
}

#[test]
fn test_writer_only() {
    leak_check(writer_only, false);
}

#[test]
fn test_single_reader() {
    leak_check(single_reader, false);
}

#[test]
fn test_wraparound() {
    leak_check(wraparound, false);
}

#[test]
fn test_random_readers() {
    leak_check(random_readers, false);
}

#[cfg(target_pointer_width = "64")]
#[test]
#[ignore = "maps and fills more than 2^32 items"]
fn large_writer_only() {
    leak_check(writer_only, true);
}

#[cfg(target_pointer_width = "64")]
#[test]
#[ignore = "maps and fills more than 2^32 items"]
fn large_single_reader() {
    leak_check(single_reader, true);
}

#[cfg(target_pointer_width = "64")]
#[test]
#[ignore = "maps and fills more than 2^32 items"]
fn large_wraparound() {
    leak_check(wraparound, true);
}

#[cfg(target_pointer_width = "64")]
#[test]
#[ignore = "maps and fills more than 2^32 items"]
fn large_random_readers() {
    leak_check(random_readers, true);
}

// ----------------------------------------------------------------------------
// 500 items of 8 bytes, wrap forced by filling to zero space

#[test]
fn test_five_hundred_item_scenario() {
    let registry = Registry::new();
    {
        let mut buf = make(&registry, 500);
        let mut reader = buf.add_reader(0, None);
        let mut next_write = 0u64;
        let mut next_read = 0u64;

        for slot in &mut buf.write_items::<u64>()[..200] {
            *slot = next_write;
            next_write += 1;
        }
        buf.update_write_pointer(200);
        assert_eq!(reader.items_available(), 200);

        let got: Vec<u64> = reader.read_items::<u64>().to_vec();
        assert_eq!(got, (0..200).collect::<Vec<_>>());
        next_read += 200;
        reader.update_read_pointer(200);

        // fill until no space is left; the cursor passes the end of storage
        let mut last_available = reader.items_available();
        while buf.space_available() > 0 {
            let n = buf.space_available().min(64);
            for slot in &mut buf.write_items::<u64>()[..n] {
                *slot = next_write;
                next_write += 1;
            }
            buf.update_write_pointer(n);

            let available = reader.items_available();
            assert!(available > last_available);
            last_available = available;
        }
        assert!(next_write > buf.capacity() as u64);
        assert_eq!(reader.items_available(), buf.capacity() - 1);

        for &v in reader.read_items::<u64>() {
            assert_eq!(v, next_read);
            next_read += 1;
        }
        let m = reader.items_available();
        reader.update_read_pointer(m);
        assert_eq!(next_read, next_write);
        assert_eq!(buf.space_available(), buf.capacity() - 1);
    }
    assert_eq!(registry.live(), LiveCounts::default());
}

// ----------------------------------------------------------------------------
// readers attached at different times see their own suffix

#[test]
fn test_late_attach_suffix() {
    let registry = Registry::new();
    let mut buf = make(&registry, WRAP_ITEMS);
    let mut early = buf.add_reader(0, None);

    let mut counter = 0u64;
    let mut write = |buf: &mut Buffer, n: usize| {
        for slot in &mut buf.write_items::<u64>()[..n] {
            *slot = counter;
            counter += 1;
        }
        buf.update_write_pointer(n);
    };

    write(&mut buf, 100);
    let mut late = buf.add_reader(10, None);
    write(&mut buf, 50);

    assert_eq!(early.items_available(), 150);
    assert_eq!(late.items_available(), 60);
    assert_eq!(late.read_items::<u64>()[0], 90);
    assert_eq!(*late.read_items::<u64>().last().unwrap(), 149);

    late.update_read_pointer(60);
    // the early reader still holds the producer back
    assert_eq!(buf.space_available(), buf.capacity() - 1 - 150);
    early.update_read_pointer(150);
    assert_eq!(buf.space_available(), buf.capacity() - 1);

    drop(late);
    drop(early);
    drop(buf);
    assert_eq!(registry.live(), LiveCounts::default());
}

// ----------------------------------------------------------------------------
// accounting at 2^32+ items without touching the pages

#[cfg(target_pointer_width = "64")]
#[test]
fn test_large_accounting_matches_small() {
    fn check(items: usize) {
        let mut buf = Buffer::new(items, 1, None).unwrap();
        let cap = buf.capacity();
        assert!(cap >= items);

        let mut reader = buf.add_reader(0, None);
        assert_eq!(buf.space_available(), cap - 1);

        let chunk = cap / 3;
        buf.update_write_pointer(chunk);
        buf.update_write_pointer(chunk);
        assert_eq!(reader.items_available(), 2 * chunk);
        assert_eq!(buf.space_available(), cap - 1 - 2 * chunk);

        reader.update_read_pointer(2 * chunk);
        let rest = buf.space_available();
        assert_eq!(rest, cap - 1);
        buf.update_write_pointer(rest);
        assert_eq!(reader.items_available(), cap - 1);
        assert!(buf.nitems_written() > cap as u64);
        assert_eq!(buf.space_available(), 0);
        assert_eq!(buf.write_offset(), (2 * chunk + rest) % cap);
    }

    check(4096 * 4);
    check(u32::MAX as usize + 4096);
}

#[test]
fn test_configuration_errors_create_nothing() {
    let registry = Registry::new();
    let err = Buffer::builder(0, 8).registry(&registry).build().unwrap_err();
    assert!(matches!(err, BufferError::ZeroCapacity));
    let err = Buffer::builder(8, 0).registry(&registry).build().unwrap_err();
    assert!(matches!(err, BufferError::ZeroItemSize));
    assert!(err.is_configuration());
    assert_eq!(registry.live(), LiveCounts::default());
}
