use smallvec::SmallVec;

/// A small fixed set of per-frame values indexed by a rotating frame
/// counter. Swap chains rarely run more than triple buffered, so the
/// storage is inline.
pub(crate) struct DoubleBuffered<T> {
    data: SmallVec<[T; 3]>,
}

impl<T> DoubleBuffered<T> {
    pub(crate) fn try_new<E, F: FnMut(u32) -> Result<T, E>>(
        count: usize,
        mut creator: F,
    ) -> Result<DoubleBuffered<T>, E> {
        let mut data = SmallVec::with_capacity(count);
        for ix in 0..count {
            data.push(creator(ix as u32)?);
        }
        Ok(DoubleBuffered { data })
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn current(&self, ix: u32) -> &T {
        &self.data[ix as usize % self.data.len()]
    }

    pub(crate) fn current_mut(&mut self, ix: u32) -> &mut T {
        let len = self.data.len();
        &mut self.data[ix as usize % len]
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.data.iter_mut()
    }
}
