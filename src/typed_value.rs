//! Type-erased storage for settled promise payloads.
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A cell holding one value of an arbitrary type, or nothing.
///
/// The payload lives behind an [`Arc`] so a reader that only needs a
/// reference can take a cheap handle with [`TypedValue::share`] and release
/// whatever lock guards the cell before running user code. Moving the value
/// out with [`TypedValue::into_inner`] only succeeds while no such handle is
/// alive.
///
/// # Examples
///
/// ```
/// use promise_graph::TypedValue;
///
/// let mut value = TypedValue::new(7_u32);
/// assert!(value.is::<u32>());
/// assert_eq!(*value.get::<u32>(), 7);
///
/// value.emplace(String::from("seven"));
/// assert!(value.is::<String>());
///
/// let moved = value.take();
/// assert!(!value.has_value());
/// assert_eq!(moved.into_inner::<String>().ok(), Some("seven".into()));
/// ```
#[derive(Default)]
pub struct TypedValue {
    payload: Option<Payload>,
}

struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl TypedValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            payload: Some(Payload {
                value: Arc::new(value),
                type_name: std::any::type_name::<T>(),
            }),
        }
    }

    /// Drops the current payload, if any, and stores `value`.
    pub fn emplace<T: Any + Send + Sync>(&mut self, value: T) {
        *self = Self::new(value);
    }

    pub fn reset(&mut self) {
        self.payload = None;
    }

    /// Moves the payload out, leaving this cell empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn has_value(&self) -> bool {
        self.payload.is_some()
    }

    pub fn type_id(&self) -> Option<TypeId> {
        self.payload.as_ref().map(|p| Any::type_id(&*p.value))
    }

    pub fn type_name(&self) -> Option<&'static str> {
        self.payload.as_ref().map(|p| p.type_name)
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id() == Some(TypeId::of::<T>())
    }

    pub fn try_get<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.value.downcast_ref::<T>()
    }

    /// Borrows the payload as `T`.
    ///
    /// # Panics
    ///
    /// Panics if the cell is empty or holds another type.
    pub fn get<T: Any>(&self) -> &T {
        match self.try_get::<T>() {
            Some(value) => value,
            None => panic!(
                "TypedValue::get: expected {}, found {}",
                std::any::type_name::<T>(),
                self.type_name().unwrap_or("nothing")
            ),
        }
    }

    /// Returns a shared handle to the payload if it is a `T`.
    pub fn share<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let payload = self.payload.as_ref()?;
        Arc::clone(&payload.value).downcast::<T>().ok()
    }

    /// Moves the payload out as `T`.
    ///
    /// Fails, handing the cell back untouched, when it is empty, holds
    /// another type, or a handle from [`TypedValue::share`] is still alive.
    pub fn into_inner<T: Any + Send + Sync>(self) -> Result<T, Self> {
        let Some(Payload { value, type_name }) = self.payload else {
            return Err(Self::default());
        };
        match value.downcast::<T>() {
            Ok(typed) => Arc::try_unwrap(typed).map_err(|shared| Self {
                payload: Some(Payload { value: shared, type_name }),
            }),
            Err(value) => Err(Self {
                payload: Some(Payload { value, type_name }),
            }),
        }
    }
}

impl fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.type_name() {
            Some(name) => write!(f, "TypedValue<{name}>"),
            None => f.write_str("TypedValue<empty>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TypedValue;
    use std::any::TypeId;

    #[test]
    fn test_emplace_replaces_payload() {
        let mut value = TypedValue::default();
        assert!(!value.has_value());
        assert_eq!(value.type_id(), None);

        value.emplace(1_i32);
        assert_eq!(value.type_id(), Some(TypeId::of::<i32>()));
        value.emplace(vec![1_u8, 2]);
        assert!(value.is::<Vec<u8>>());
        assert!(!value.is::<i32>());
        assert_eq!(value.get::<Vec<u8>>(), &vec![1, 2]);

        value.reset();
        assert!(!value.has_value());
    }

    #[test]
    #[should_panic(expected = "TypedValue::get: expected u64")]
    fn test_get_with_wrong_type_panics() {
        let value = TypedValue::new(5_i32);
        let _ = value.get::<u64>();
    }

    #[test]
    fn test_into_inner_waits_for_shared_handles() {
        let value = TypedValue::new(String::from("🍓"));
        let shared = value.share::<String>().unwrap();

        let value = value.into_inner::<String>().unwrap_err();
        assert_eq!(value.try_get::<String>().map(String::as_str), Some("🍓"));

        drop(shared);
        assert_eq!(value.into_inner::<String>().unwrap(), "🍓");
    }

    #[test]
    fn test_take_leaves_source_empty() {
        let mut source = TypedValue::new(3_u8);
        let target = source.take();
        assert!(!source.has_value());
        assert_eq!(*target.get::<u8>(), 3);
        assert!(source.into_inner::<u8>().is_err());
    }

    #[test]
    fn test_mismatched_into_inner_keeps_value() {
        let value = TypedValue::new(9_u16);
        let value = value.into_inner::<u32>().unwrap_err();
        assert_eq!(format!("{value:?}"), "TypedValue<u16>");
    }
}
