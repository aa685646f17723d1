//! In-process pub/sub transport.
//!
//! Addresses of the form `inproc://<name>` share a process-global registry
//! of hubs. At most one endpoint binds a given name at a time; any number
//! connect, and connecting before the binder arrives is allowed. Publishing
//! delivers a copy to every subscriber whose filter set matches the first
//! two datagram bytes; subscriber queues are bounded and overflow drops the
//! datagram.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use super::buffer::{Buffer, BufferPool};
use super::error::{Result, TransportError};
use super::{PubSocket, Role, SubSocket};

/// Pooled backing size for hub datagrams.
const HUB_BUFFER_SIZE: usize = 2048;
/// Buffers retained per hub.
const HUB_POOL_BUFFERS: usize = 256;
/// Datagrams a subscriber may queue before overflow drops.
const SUB_QUEUE_CAPACITY: usize = 256;

static HUBS: LazyLock<Mutex<HashMap<String, Arc<Hub>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn hub(name: &str) -> Arc<Hub> {
    let mut hubs = HUBS.lock().expect("hub registry mutex poisoned");
    Arc::clone(hubs.entry(name.to_owned()).or_insert_with(|| {
        Arc::new(Hub {
            name: name.to_owned(),
            pool: BufferPool::new(HUB_BUFFER_SIZE, HUB_POOL_BUFFERS),
            bound: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        })
    }))
}

pub(super) fn open_pub(name: &str, role: Role) -> Result<Arc<dyn PubSocket>> {
    let hub = hub(name);
    let bound = claim(&hub, role)?;
    Ok(Arc::new(InprocPub { hub, bound }))
}

pub(super) fn open_sub(name: &str, role: Role) -> Result<Arc<dyn SubSocket>> {
    let hub = hub(name);
    let bound = claim(&hub, role)?;
    let queue = Arc::new(SubQueue::new());
    hub.subscribers
        .lock()
        .expect("subscriber list mutex poisoned")
        .push(Arc::clone(&queue));
    Ok(Arc::new(InprocSub { hub, queue, bound }))
}

fn claim(hub: &Hub, role: Role) -> Result<bool> {
    match role {
        Role::Connect => Ok(false),
        Role::Bind => {
            if hub
                .bound
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(TransportError::AddressInUse {
                    addr: format!("inproc://{}", hub.name),
                });
            }
            Ok(true)
        }
    }
}

struct Hub {
    name: String,
    pool: BufferPool,
    bound: AtomicBool,
    subscribers: Mutex<Vec<Arc<SubQueue>>>,
}

impl Hub {
    fn publish(&self, datagram: &[u8]) {
        let subscribers = self
            .subscribers
            .lock()
            .expect("subscriber list mutex poisoned");
        for subscriber in subscribers.iter() {
            if !subscriber.matches(datagram) {
                continue;
            }
            let mut copy = self.pool.alloc(datagram.len());
            copy.as_mut_slice().copy_from_slice(datagram);
            subscriber.push(copy, &self.name);
        }
    }

    fn detach(&self, queue: &Arc<SubQueue>) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("subscriber list mutex poisoned");
        subscribers.retain(|candidate| !Arc::ptr_eq(candidate, queue));
    }

    fn release_binding(&self) {
        self.bound.store(false, Ordering::Release);
    }
}

struct SubQueue {
    datagrams: Mutex<VecDeque<Buffer>>,
    cond: Condvar,
    filters: Mutex<Vec<[u8; 2]>>,
    timeout: Mutex<Option<Duration>>,
}

impl SubQueue {
    fn new() -> Self {
        Self {
            datagrams: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            filters: Mutex::new(Vec::new()),
            timeout: Mutex::new(None),
        }
    }

    fn matches(&self, datagram: &[u8]) -> bool {
        if datagram.len() < 2 {
            return false;
        }
        let prefix = [datagram[0], datagram[1]];
        self.filters
            .lock()
            .expect("filter list mutex poisoned")
            .iter()
            .any(|filter| *filter == prefix)
    }

    fn push(&self, datagram: Buffer, hub_name: &str) {
        let mut queue = self
            .datagrams
            .lock()
            .expect("subscriber queue mutex poisoned");
        if queue.len() >= SUB_QUEUE_CAPACITY {
            trace!(hub = hub_name, "subscriber queue full, dropping datagram");
            return;
        }
        queue.push_back(datagram);
        drop(queue);
        self.cond.notify_one();
    }
}

struct InprocPub {
    hub: Arc<Hub>,
    bound: bool,
}

impl PubSocket for InprocPub {
    fn alloc_msg(&self, len: usize) -> Buffer {
        self.hub.pool.alloc(len)
    }

    fn send(&self, buffer: Buffer) -> Result<()> {
        self.hub.publish(buffer.as_slice());
        Ok(())
    }
}

impl Drop for InprocPub {
    fn drop(&mut self) {
        if self.bound {
            self.hub.release_binding();
        }
    }
}

struct InprocSub {
    hub: Arc<Hub>,
    queue: Arc<SubQueue>,
    bound: bool,
}

impl std::fmt::Debug for InprocSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InprocSub")
            .field("hub", &self.hub.name)
            .field("bound", &self.bound)
            .finish()
    }
}

impl SubSocket for InprocSub {
    fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        *self
            .queue
            .timeout
            .lock()
            .expect("timeout mutex poisoned") = Some(timeout);
        Ok(())
    }

    fn subscribe(&self, prefix: [u8; 2]) -> Result<()> {
        let mut filters = self
            .queue
            .filters
            .lock()
            .expect("filter list mutex poisoned");
        if !filters.contains(&prefix) {
            filters.push(prefix);
        }
        Ok(())
    }

    fn unsubscribe(&self, prefix: [u8; 2]) -> Result<()> {
        self.queue
            .filters
            .lock()
            .expect("filter list mutex poisoned")
            .retain(|filter| *filter != prefix);
        Ok(())
    }

    fn recv(&self) -> Result<Buffer> {
        let timeout = *self.queue.timeout.lock().expect("timeout mutex poisoned");
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let mut queue = self
            .queue
            .datagrams
            .lock()
            .expect("subscriber queue mutex poisoned");
        loop {
            if let Some(datagram) = queue.pop_front() {
                return Ok(datagram);
            }
            match deadline {
                None => {
                    queue = self
                        .queue
                        .cond
                        .wait(queue)
                        .expect("subscriber queue mutex poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    let (guard, _) = self
                        .queue
                        .cond
                        .wait_timeout(queue, deadline - now)
                        .expect("subscriber queue mutex poisoned");
                    queue = guard;
                }
            }
        }
    }
}

impl Drop for InprocSub {
    fn drop(&mut self) {
        self.hub.detach(&self.queue);
        if self.bound {
            self.hub.release_binding();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{open_pub, open_sub};
    use super::*;

    fn fill(publisher: &Arc<dyn PubSocket>, bytes: &[u8]) {
        let mut buffer = publisher.alloc_msg(bytes.len());
        buffer.as_mut_slice().copy_from_slice(bytes);
        publisher.send(buffer).unwrap();
    }

    #[test]
    fn bind_conflict_is_rejected() {
        let first = open_pub("inproc://bind-conflict", Role::Bind).unwrap();
        let err = open_sub("inproc://bind-conflict", Role::Bind).unwrap_err();
        assert!(matches!(err, TransportError::AddressInUse { .. }));
        drop(first);
        // the address is free again after the binder is dropped
        open_pub("inproc://bind-conflict", Role::Bind).unwrap();
    }

    #[test]
    fn delivery_respects_prefix_filter() {
        let publisher = open_pub("inproc://filter", Role::Bind).unwrap();
        let subscriber = open_sub("inproc://filter", Role::Connect).unwrap();
        subscriber.set_recv_timeout(Duration::from_millis(20)).unwrap();
        subscriber.subscribe([0xAA, 0xBB]).unwrap();

        fill(&publisher, &[0xAA, 0xBB, 1, 2, 3]);
        fill(&publisher, &[0xCC, 0xDD, 4, 5, 6]);

        let received = subscriber.recv().unwrap();
        assert_eq!(received.as_slice(), &[0xAA, 0xBB, 1, 2, 3]);
        assert_eq!(subscriber.recv().unwrap_err(), TransportError::Timeout);
    }

    #[test]
    fn unfiltered_subscriber_receives_nothing() {
        let publisher = open_pub("inproc://no-filter", Role::Bind).unwrap();
        let subscriber = open_sub("inproc://no-filter", Role::Connect).unwrap();
        subscriber.set_recv_timeout(Duration::from_millis(20)).unwrap();

        fill(&publisher, &[1, 2, 3]);
        assert_eq!(subscriber.recv().unwrap_err(), TransportError::Timeout);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let publisher = open_pub("inproc://unsub", Role::Bind).unwrap();
        let subscriber = open_sub("inproc://unsub", Role::Connect).unwrap();
        subscriber.set_recv_timeout(Duration::from_millis(20)).unwrap();
        subscriber.subscribe([7, 7]).unwrap();

        fill(&publisher, &[7, 7, 1]);
        assert_eq!(subscriber.recv().unwrap().as_slice(), &[7, 7, 1]);

        subscriber.unsubscribe([7, 7]).unwrap();
        fill(&publisher, &[7, 7, 2]);
        assert_eq!(subscriber.recv().unwrap_err(), TransportError::Timeout);
    }

    #[test]
    fn connect_before_bind_is_allowed() {
        let subscriber = open_sub("inproc://late-bind", Role::Connect).unwrap();
        subscriber.set_recv_timeout(Duration::from_millis(50)).unwrap();
        subscriber.subscribe([9, 9]).unwrap();

        let publisher = open_pub("inproc://late-bind", Role::Bind).unwrap();
        fill(&publisher, &[9, 9, 42]);
        assert_eq!(subscriber.recv().unwrap().as_slice(), &[9, 9, 42]);
    }
}
