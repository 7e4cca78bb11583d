use super::Error;
use std::sync::Mutex;

/// Sticky fault shared by the front door and the drain loop.
///
/// Once set, the first fault is kept forever and returned by every subsequent check.
#[derive(Default)]
pub(super) struct Fault(Mutex<Option<Error>>);

impl Fault {
    /// Return the recorded fault, if any.
    pub fn get(&self) -> Option<Error> {
        self.0.lock().unwrap().clone()
    }

    /// Fail with the recorded fault, if any.
    pub fn check(&self) -> Result<(), Error> {
        match self.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record `err` unless a fault is already set. Returns the fault that is now in effect.
    pub fn set(&self, err: Error) -> Error {
        self.0.lock().unwrap().get_or_insert(err).clone()
    }

    /// Record the error of `result` if it is an I/O fault and pass the result through.
    ///
    /// Validation and callback faults are returned untouched.
    pub fn observe<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        match result {
            Err(err @ Error::Io(_)) => Err(self.set(err)),
            other => other,
        }
    }
}
