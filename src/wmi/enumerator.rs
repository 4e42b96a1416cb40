//! Forward-only cursor over a query result

use super::{Instance, RawEnum};
use crate::mapper::WmiRecord;
use crate::Result;

/// Owning cursor over query results.
///
/// Once the broker reports the end of the result set the cursor stays done;
/// later calls return `Ok(None)` without touching the broker again.
pub struct Enumerator {
    raw: Option<Box<dyn RawEnum>>,
}

impl Enumerator {
    pub fn from_raw(raw: Box<dyn RawEnum>) -> Self {
        Self { raw: Some(raw) }
    }

    pub fn is_done(&self) -> bool {
        self.raw.is_none()
    }

    /// Next instance, or `Ok(None)` when exhausted
    pub fn next_instance(&mut self) -> Result<Option<Instance>> {
        let Some(raw) = self.raw.as_mut() else {
            return Ok(None);
        };
        match raw.next()? {
            Some(object) => Ok(Some(Instance::from_raw(object))),
            None => {
                self.raw = None;
                Ok(None)
            }
        }
    }

    /// Next result decoded into a record; the instance handle is released
    pub fn next_record<R: WmiRecord>(&mut self) -> Result<Option<R>> {
        match self.next_instance()? {
            Some(instance) => instance.get_all().map(Some),
            None => Ok(None),
        }
    }

    /// Release the cursor now
    pub fn close(self) {
        drop(self);
    }
}

impl Iterator for Enumerator {
    type Item = Result<Instance>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_instance().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{ObjectRef, Variant};
    use crate::wmi::memory::{ClassDef, MemoryBroker};
    use crate::variant::{CimBase, CimType};
    use crate::Error;
    use std::collections::VecDeque;

    struct Scripted {
        items: VecDeque<ObjectRef>,
        calls_after_end: usize,
        ended: bool,
    }

    impl RawEnum for Scripted {
        fn next(&mut self) -> Result<Option<ObjectRef>> {
            if self.ended {
                self.calls_after_end += 1;
                return Err(Error::Remote("cursor used after end".into()));
            }
            let next = self.items.pop_front();
            self.ended = next.is_none();
            Ok(next)
        }
    }

    #[test]
    fn test_done_is_terminal() {
        let broker = MemoryBroker::new();
        broker.define_class(ClassDef::new("Msvm_Part").property("Name", CimType::scalar(CimBase::String)));
        let path = broker.insert_instance("Msvm_Part", [("Name", Variant::String("p".into()))]).unwrap();

        let mut cursor = Enumerator::from_raw(Box::new(Scripted {
            items: VecDeque::from([broker.object(&path).unwrap()]),
            calls_after_end: 0,
            ended: false,
        }));

        assert!(cursor.next_instance().unwrap().is_some());
        assert!(cursor.next_instance().unwrap().is_none());
        assert!(cursor.is_done());
        // a second poll must not reach the exhausted remote cursor
        assert!(cursor.next_instance().unwrap().is_none());
        assert!(cursor.next().is_none());
    }
}
