use std::{
    marker::PhantomData,
    ops::{Index, IndexMut},
};

use serde::{Deserialize, Serialize};

/// A dense, insertion-ordered arena addressed by a typed id.
///
/// Iteration order is insertion order, which keeps graph traversals
/// and repeated simulation runs deterministic.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Arena<Id: IdLike, T> {
    inner: Vec<T>,
    _phantom: PhantomData<Id>,
}

impl<Id: IdLike, T> Arena<Id, T> {
    pub fn new() -> Self {
        Self {
            inner: Vec::new(),
            _phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn push(&mut self, x: T) -> Id {
        let id = Id::from_raw(self.inner.len());
        self.inner.push(x);
        id
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.inner.get(id.into_raw())
    }

    pub fn contains(&self, id: Id) -> bool {
        id.into_raw() < self.inner.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.inner
            .iter()
            .enumerate()
            .map(|(i, v)| (Id::from_raw(i), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id, &mut T)> {
        self.inner
            .iter_mut()
            .enumerate()
            .map(|(i, v)| (Id::from_raw(i), v))
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        (0..self.inner.len()).map(Id::from_raw)
    }
}

impl<Id: IdLike, T> Default for Arena<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: IdLike, T> Index<Id> for Arena<Id, T> {
    type Output = T;

    fn index(&self, index: Id) -> &Self::Output {
        &self.inner[index.into_raw()]
    }
}

impl<Id: IdLike, T> IndexMut<Id> for Arena<Id, T> {
    fn index_mut(&mut self, index: Id) -> &mut Self::Output {
        &mut self.inner[index.into_raw()]
    }
}

pub trait IdLike: Copy {
    fn from_raw(index: usize) -> Self;
    fn into_raw(self) -> usize;
}
