//! Integration tests for the in-memory parameter store
//!
//! Exercises the store the way the relays and the executor share it:
//! concurrently, through `Arc<dyn ParamStore>`.

use common::{MemoryStore, ParamStore, Requester, SlotIndex, Stream};
use protocol::{DeviceIdentity, ParamValue, ParamValues};
use std::sync::Arc;
use std::thread;

fn device_identity(device_type: u16) -> DeviceIdentity {
    DeviceIdentity::new(device_type, 20, 0x1000 + device_type as u64)
}

#[test]
fn test_concurrent_connects_get_distinct_slots() {
    let store: Arc<dyn ParamStore> = Arc::new(MemoryStore::new());

    let handles: Vec<_> = (0..8u16)
        .map(|device_type| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .connect(device_identity(device_type))
                    .unwrap()
            })
        })
        .collect();

    let mut slots: Vec<SlotIndex> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    slots.sort();
    slots.dedup();
    assert_eq!(slots.len(), 8);
    assert!(slots.iter().all(|slot| slot.0 < 8));
}

#[test]
fn test_executor_command_reaches_dev_handler() {
    let store = Arc::new(MemoryStore::new());
    let slot = store.connect(device_identity(7)).unwrap();

    let executor = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let mut command = ParamValues::new();
            command.insert(1, ParamValue::Float(0.75));
            store
                .write(slot, Requester::Executor, Stream::Command, 0b10, &command)
                .unwrap();
        })
    };
    executor.join().unwrap();

    let pending = store.pending_writes();
    assert_eq!(pending.devices, 1 << slot.0);

    let mask = pending.for_slot(slot);
    let values = store
        .read(slot, Requester::DevHandler, Stream::Command, mask)
        .unwrap();
    assert_eq!(values.get(&1), Some(&ParamValue::Float(0.75)));
    assert_eq!(store.pending_writes().devices, 0);
}
