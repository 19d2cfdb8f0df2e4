//! Typed projections of entities.
//!
//! A projection maps an entity, or its absence, onto a value of the caller's choosing and remembers the last value it
//! produced. How two values are compared is not implied: the caller names an [`Equality`] strategy, and a watcher is
//! only called when the projected value changes under it.

use crate::bus::Event;
use crate::bus::Subscription;
use crate::bus::Topic;
use crate::engine::Engine;
use crate::traits::DataSource;
use crate::types::EntityKey;
use crate::types::EntitySnapshot;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

pub enum Equality<T> {
    /// `PartialEq`.
    Structural,
    /// Every new value counts as a change.
    Never,
    Custom(fn(&T, &T) -> bool),
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Equality<T> {}

impl<T> Debug for Equality<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structural => write!(f, "Equality::Structural"),
            Self::Never => write!(f, "Equality::Never"),
            Self::Custom(_) => write!(f, "Equality::Custom(..)"),
        }
    }
}

impl<T> Equality<T>
where
    T: PartialEq,
{
    pub fn same(&self, a: &T, b: &T) -> bool {
        match self {
            Self::Structural => a == b,
            Self::Never => false,
            Self::Custom(eq) => eq(a, b),
        }
    }
}

type Projector<S, T> = Box<dyn Fn(Option<&S>) -> T + Send + Sync>;

pub struct Projection<S, T> {
    project:  Projector<S, T>,
    equality: Equality<T>,
    current:  Option<T>,
}

impl<S, T> Projection<S, T>
where
    T: PartialEq,
{
    pub fn new<F>(project: F, equality: Equality<T>) -> Self
    where
        F: Fn(Option<&S>) -> T + Send + Sync + 'static,
    {
        Self {
            project: Box::new(project),
            equality,
            current: None,
        }
    }

    /// Project `source`. Returns the new value only if it differs from the previous one; the first call always does.
    pub fn apply(&mut self, source: Option<&S>) -> Option<&T> {
        let next = (self.project)(source);
        if self.current.as_ref().is_some_and(|current| self.equality.same(current, &next)) {
            return None;
        }
        Some(&*self.current.insert(next))
    }

    /// The last projected value, projecting `source` first if there isn't one yet.
    pub fn seed(&mut self, source: Option<&S>) -> &T {
        let project = &self.project;
        self.current.get_or_insert_with(|| project(source))
    }

    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    pub fn equality(&self) -> Equality<T> {
        self.equality
    }
}

impl<S, T> Debug for Projection<S, T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("equality", &self.equality)
            .field("current", &self.current)
            .finish()
    }
}

impl<DS> Engine<DS>
where
    DS: DataSource,
{
    /// Watch a projection of one entity. Returns the current projected value along with the subscription keeping the
    /// watch alive. `callback` runs on the notification bus whenever the projected value changes.
    pub fn watch_entity<T, P, C>(
        &self,
        key: EntityKey,
        projector: P,
        equality: Equality<T>,
        callback: C,
    ) -> (T, Subscription)
    where
        T: Clone + PartialEq + Send + 'static,
        P: Fn(Option<&EntitySnapshot<DS::Value>>) -> T + Send + Sync + 'static,
        C: Fn(&T) + Send + Sync + 'static,
    {
        let projection = Arc::new(Mutex::new(Projection::new(projector, equality)));

        let subscription = {
            let projection = Arc::clone(&projection);
            self.subscribe(Topic::Entity(key.clone()), move |event| {
                let changed = {
                    let mut projection = projection.lock();
                    match event {
                        Event::EntityChanged(snapshot) => projection.apply(Some(snapshot)).cloned(),
                        Event::EntityRemoved { .. } => projection.apply(None).cloned(),
                        _ => None,
                    }
                };
                if let Some(value) = changed {
                    callback(&value);
                }
            })
        };

        let snapshot = self.get(&key);
        let initial = projection.lock().seed(snapshot.as_ref()).clone();
        (initial, subscription)
    }
}
