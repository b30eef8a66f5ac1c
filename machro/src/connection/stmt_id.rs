//! Statement id allocation.
use crate::error::StatusError;

/// Maximum concurrent statement per connection.
pub const MAX_STMT: usize = 1024;

const WORDS: usize = MAX_STMT / 64;

/// Round robin statement id allocator.
///
/// Allocation scans from the slot after the last allocated id, so a released
/// id is only handed out again after every other free id had its turn.
#[derive(Debug)]
pub struct StmtIds {
    used: [u64; WORDS],
    count: usize,
    cursor: usize,
}

impl Default for StmtIds {
    fn default() -> Self {
        Self { used: [0; WORDS], count: 0, cursor: 0 }
    }
}

impl StmtIds {
    pub fn alloc(&mut self) -> Result<u32, StatusError> {
        if self.count >= MAX_STMT {
            return Err(StatusError::client(format!(
                "Statement ID overflow (Limit = {MAX_STMT}, Curr = {}).",
                self.count
            )));
        }

        for step in 0..MAX_STMT {
            let id = (self.cursor + step) % MAX_STMT;
            if !self.is_used(id) {
                self.used[id / 64] |= 1 << (id % 64);
                self.count += 1;
                self.cursor = (id + 1) % MAX_STMT;
                return Ok(id as u32);
            }
        }

        unreachable!("count is below the limit, a free slot exists")
    }

    pub fn release(&mut self, id: u32) {
        let id = id as usize;
        if id < MAX_STMT && self.is_used(id) {
            self.used[id / 64] &= !(1 << (id % 64));
            self.count -= 1;
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn is_used(&self, id: usize) -> bool {
        self.used[id / 64] & (1 << (id % 64)) != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overflow_and_round_robin() {
        let mut ids = StmtIds::default();
        let all = (0..MAX_STMT).map(|_| ids.alloc().unwrap()).collect::<Vec<_>>();
        assert_eq!(all, (0..MAX_STMT as u32).collect::<Vec<_>>());

        let err = ids.alloc().unwrap_err();
        assert_eq!(err.message(), "Statement ID overflow (Limit = 1024, Curr = 1024).");
        assert_eq!(err.code(), 0);

        ids.release(7);
        assert_eq!(ids.count(), MAX_STMT - 1);
        assert_eq!(ids.alloc().unwrap(), 7);
    }

    #[test]
    fn released_id_waits_its_turn() {
        let mut ids = StmtIds::default();
        let a = ids.alloc().unwrap();
        let b = ids.alloc().unwrap();
        ids.release(a);

        // cursor moves forward instead of reusing `a`
        let c = ids.alloc().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        ids.release(5000);
        ids.release(b);
        ids.release(b);
        assert_eq!(ids.count(), 1);
    }
}
