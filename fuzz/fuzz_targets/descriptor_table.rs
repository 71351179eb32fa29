#![no_main]
use libfuzzer_sys::fuzz_target;
use usbpoll_core::os::Descriptor;
use usbpoll_core::{DescriptorTable, Interest, LoopbackCaps, LoopbackDevice, WaitRequest};

// Each input byte is one operation against a small table; nothing here may block.
fuzz_target!(|data: &[u8]| {
    let table = DescriptorTable::with_capacity(8);
    let dev = LoopbackDevice::new(LoopbackCaps::default());
    let mut live: Vec<Descriptor> = Vec::new();

    for &b in data {
        let pick = live.get((b >> 3) as usize % live.len().max(1)).copied();
        match b & 0x07 {
            0 => {
                let interest = if b & 0x80 != 0 { Interest::Writable } else { Interest::Readable };
                if let Ok(id) = table.allocate(dev.clone(), interest, 1 + (b as usize >> 4) % 4) {
                    live.push(id);
                }
            }
            1 => {
                if let Ok((id, _)) = table.create_pipe() {
                    live.push(id);
                }
            }
            2 => {
                if let Some(id) = pick {
                    assert!(table.free(id).is_ok());
                    live.retain(|&d| d != id);
                    assert!(table.lookup(id).is_err());
                }
            }
            3 => {
                if let Some(id) = pick {
                    if let Ok(c) = table.arm(id, (b >> 5) as usize, 64) {
                        dev.submit(c);
                    }
                }
            }
            4 => {
                if b & 0x10 != 0 {
                    dev.complete_next((b >> 5) as usize * 8);
                } else {
                    dev.complete_next_full();
                }
            }
            5 => {
                if let Some(id) = pick {
                    let _ = table.signal(id);
                    let _ = table.consume(id, 0);
                }
            }
            6 => {
                if let Some(id) = pick {
                    let _ = table.rearm(id);
                    let _ = table.cancel(id, None);
                }
            }
            _ => {
                let mut reqs: Vec<WaitRequest> = live.iter().map(|&id| WaitRequest::readable(id)).collect();
                if let Ok(n) = table.poll(&mut reqs, 0) {
                    assert_eq!(n, reqs.iter().filter(|r| r.is_ready()).count());
                }
            }
        }
        assert!(table.live() <= table.capacity());
        assert_eq!(table.live(), live.len());
    }
});
