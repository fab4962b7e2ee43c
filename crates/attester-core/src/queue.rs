//! Binary min-heap keyed by a millisecond timestamp.
//!
//! Entries with equal keys pop in insertion order.

#[derive(Debug)]
pub struct PriorityQueue<T> {
	heap: Vec<Entry<T>>,
	next_seq: u64,
}

#[derive(Debug)]
struct Entry<T> {
	key: u64,
	seq: u64,
	value: T,
}

impl<T> Entry<T> {
	fn rank(&self) -> (u64, u64) {
		(self.key, self.seq)
	}
}

impl<T> Default for PriorityQueue<T> {
	fn default() -> Self {
		Self {
			heap: Vec::new(),
			next_seq: 0,
		}
	}
}

impl<T> PriorityQueue<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}

	pub fn push(&mut self, key: u64, value: T) {
		let seq = self.next_seq;
		self.next_seq += 1;
		self.heap.push(Entry { key, seq, value });
		self.sift_up(self.heap.len() - 1);
	}

	pub fn pop(&mut self) -> Option<T> {
		self.pop_entry().map(|(_, value)| value)
	}

	/// Removes the earliest entry, returning its key as well.
	pub fn pop_entry(&mut self) -> Option<(u64, T)> {
		if self.heap.is_empty() {
			return None;
		}

		let last = self.heap.len() - 1;
		self.heap.swap(0, last);
		let entry = self.heap.pop();
		self.sift_down(0);
		entry.map(|entry| (entry.key, entry.value))
	}

	pub fn peek(&self) -> Option<&T> {
		self.heap.first().map(|entry| &entry.value)
	}

	pub fn peek_key(&self) -> Option<u64> {
		self.heap.first().map(|entry| entry.key)
	}

	pub fn iter(&self) -> impl Iterator<Item = &T> {
		self.heap.iter().map(|entry| &entry.value)
	}

	fn sift_up(&mut self, mut index: usize) {
		while index > 0 {
			let parent = (index - 1) / 2;
			if self.heap[parent].rank() <= self.heap[index].rank() {
				break;
			}
			self.heap.swap(parent, index);
			index = parent;
		}
	}

	fn sift_down(&mut self, mut index: usize) {
		let len = self.heap.len();
		loop {
			let left = 2 * index + 1;
			if left >= len {
				break;
			}

			let right = left + 1;
			let smallest = if right < len && self.heap[right].rank() < self.heap[left].rank() {
				right
			} else {
				left
			};

			if self.heap[index].rank() <= self.heap[smallest].rank() {
				break;
			}
			self.heap.swap(index, smallest);
			index = smallest;
		}
	}
}
