use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ledgit_resilience::RemoteError;

use super::{Locator, RemoteStorage};

/// Which calls a queued fault applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FaultTarget {
    Put,
    Get,
    Any,
}

/// In-memory remote backend with fault injection and call accounting.
///
/// Locators are sequential (`mem-1`, `mem-2`, ...), so they carry no
/// information about the content, like a real transaction id.
#[derive(Debug)]
pub struct MemoryRemote {
    id: String,
    objects: Mutex<HashMap<Locator, Bytes>>,
    faults: Mutex<VecDeque<(FaultTarget, RemoteError)>>,
    sticky_fault: Mutex<Option<RemoteError>>,
    latency: Mutex<Duration>,
    next_locator: AtomicU64,
    puts: AtomicUsize,
    gets: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryRemote {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            objects: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            sticky_fault: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            next_locator: AtomicU64::new(1),
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail the next put with `error`.
    pub fn fail_next_put(&self, error: RemoteError) {
        self.push_fault(FaultTarget::Put, error);
    }

    /// Fail the next get with `error`.
    pub fn fail_next_get(&self, error: RemoteError) {
        self.push_fault(FaultTarget::Get, error);
    }

    /// Fail every call with `error` until [`MemoryRemote::heal`].
    pub fn fail_always(&self, error: RemoteError) {
        *self.sticky_fault.lock().expect("remote lock poisoned") = Some(error);
    }

    pub fn heal(&self) {
        *self.sticky_fault.lock().expect("remote lock poisoned") = None;
        self.faults.lock().expect("remote lock poisoned").clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("remote lock poisoned") = latency;
    }

    /// Overwrite stored bytes, simulating remote corruption.
    pub fn tamper(&self, locator: &Locator, data: impl Into<Bytes>) -> bool {
        let mut objects = self.objects.lock().expect("remote lock poisoned");
        match objects.get_mut(locator) {
            Some(slot) => {
                *slot = data.into();
                true
            }
            None => false,
        }
    }

    /// Drop an object, simulating remote loss.
    pub fn forget(&self, locator: &Locator) -> bool {
        self.objects
            .lock()
            .expect("remote lock poisoned")
            .remove(locator)
            .is_some()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().expect("remote lock poisoned").len()
    }

    /// Put attempts that reached the backend, including failed ones.
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn push_fault(&self, target: FaultTarget, error: RemoteError) {
        self.faults
            .lock()
            .expect("remote lock poisoned")
            .push_back((target, error));
    }

    fn take_fault(&self, call: FaultTarget) -> Option<RemoteError> {
        if let Some(err) = self.sticky_fault.lock().expect("remote lock poisoned").clone() {
            return Some(err);
        }
        let mut faults = self.faults.lock().expect("remote lock poisoned");
        let pos = faults
            .iter()
            .position(|(target, _)| *target == call || *target == FaultTarget::Any)?;
        faults.remove(pos).map(|(_, err)| err)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock().expect("remote lock poisoned");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn put_object(&self, data: Bytes) -> Result<Locator, RemoteError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        if let Some(err) = self.take_fault(FaultTarget::Put) {
            return Err(err);
        }
        let n = self.next_locator.fetch_add(1, Ordering::SeqCst);
        let locator = Locator::new(format!("mem-{n}"));
        self.objects
            .lock()
            .expect("remote lock poisoned")
            .insert(locator.clone(), data);
        Ok(locator)
    }

    async fn get_object(&self, locator: &Locator) -> Result<Bytes, RemoteError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter().await;
        if let Some(err) = self.take_fault(FaultTarget::Get) {
            return Err(err);
        }
        self.objects
            .lock()
            .expect("remote lock poisoned")
            .get(locator)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(locator.to_string()))
    }

    async fn exists(&self, locator: &Locator) -> Result<bool, RemoteError> {
        let _guard = self.enter().await;
        if let Some(err) = self.take_fault(FaultTarget::Any) {
            return Err(err);
        }
        Ok(self
            .objects
            .lock()
            .expect("remote lock poisoned")
            .contains_key(locator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let remote = MemoryRemote::new("mem");
        let loc = remote.put_object(Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(remote.get_object(&loc).await.unwrap(), Bytes::from_static(b"data"));
        assert!(remote.exists(&loc).await.unwrap());
        assert_eq!(remote.put_calls(), 1);
        assert_eq!(remote.get_calls(), 1);
    }

    #[tokio::test]
    async fn locators_are_not_content_derived() {
        let remote = MemoryRemote::new("mem");
        let a = remote.put_object(Bytes::from_static(b"same")).await.unwrap();
        let b = remote.put_object(Bytes::from_static(b"same")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn queued_faults_fire_once() {
        let remote = MemoryRemote::new("mem");
        remote.fail_next_put(RemoteError::Transient("503".into()));
        assert!(remote.put_object(Bytes::from_static(b"x")).await.is_err());
        assert!(remote.put_object(Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn sticky_fault_until_healed() {
        let remote = MemoryRemote::new("mem");
        remote.fail_always(RemoteError::Fatal("down".into()));
        assert!(remote.put_object(Bytes::from_static(b"x")).await.is_err());
        assert!(remote.put_object(Bytes::from_static(b"x")).await.is_err());
        remote.heal();
        assert!(remote.put_object(Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn missing_locator_is_not_found() {
        let remote = MemoryRemote::new("mem");
        let err = remote.get_object(&Locator::new("mem-99")).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn tamper_and_forget() {
        let remote = MemoryRemote::new("mem");
        let loc = remote.put_object(Bytes::from_static(b"good")).await.unwrap();
        assert!(remote.tamper(&loc, Bytes::from_static(b"evil")));
        assert_eq!(remote.get_object(&loc).await.unwrap(), Bytes::from_static(b"evil"));
        assert!(remote.forget(&loc));
        assert_eq!(remote.object_count(), 0);
    }
}
