//! Reference model of the handle table, checked against [`HandleTable`].

use std::collections::VecDeque;

use rskt::{Handle, HandleTable, SocketState, TableError, BLOCK_SIZE};

/// Operations a harness feeds the table. Indices pick among tracked handles.
#[derive(Debug, Clone, bolero::TypeGenerator)]
pub enum TableOp {
    Acquire(u16),
    Release(u8),
    Transition { which: u8, from: u8, to: u8 },
    Update { which: u8, expect: u8, to: u8 },
    /// Poke a handle that was already released.
    UseStale(u8),
    Find(u16),
}

struct Live {
    handle: Handle,
    value: u16,
    state: SocketState,
}

/// What the table should look like after every op.
pub struct TableModel {
    blocks: usize,
    grown: usize,
    free: VecDeque<u32>,
    live: Vec<Live>,
    dead: Vec<Handle>,
}

/// Any state but `Uninit`, which only release may set.
fn settled(raw: u8) -> SocketState {
    SocketState::ALL[1 + raw as usize % (SocketState::ALL.len() - 1)]
}

impl TableModel {
    pub fn new(blocks: usize) -> Self {
        Self {
            blocks: blocks.max(1),
            grown: 0,
            free: VecDeque::new(),
            live: Vec::new(),
            dead: Vec::new(),
        }
    }

    /// Index the table should hand out next, growing a block if needed.
    fn next_index(&mut self) -> Option<u32> {
        if self.free.is_empty() && self.grown < self.blocks {
            let base = (self.grown * BLOCK_SIZE) as u32;
            self.free.extend(base..base + BLOCK_SIZE as u32);
            self.grown += 1;
        }
        self.free.pop_front()
    }

    fn pick(&self, which: u8) -> Option<usize> {
        (!self.live.is_empty()).then(|| which as usize % self.live.len())
    }

    pub fn apply(&mut self, table: &HandleTable<u16>, op: &TableOp) -> Result<(), String> {
        match *op {
            TableOp::Acquire(value) => {
                let expected = self.next_index();
                match (table.acquire(value), expected) {
                    (Ok(handle), Some(index)) => {
                        if handle.index() != index {
                            return Err(format!("acquire gave slot {}, expected {index}", handle.index()));
                        }
                        if self.dead.contains(&handle) {
                            return Err(format!("acquire reissued dead handle {handle}"));
                        }
                        self.live.push(Live {
                            handle,
                            value,
                            state: SocketState::Alloced,
                        });
                    }
                    (Err(TableError::Exhausted), None) => {}
                    (got, want) => return Err(format!("acquire: got {got:?}, expected slot {want:?}")),
                }
            }
            TableOp::Release(which) => {
                let Some(i) = self.pick(which) else { return Ok(()) };
                let entry = self.live.swap_remove(i);
                match table.release(entry.handle) {
                    Ok(value) if *value == entry.value => {}
                    other => return Err(format!("release {}: {other:?}", entry.handle)),
                }
                self.free.push_back(entry.handle.index());
                self.dead.push(entry.handle);
            }
            TableOp::Transition { which, from, to } => {
                let Some(i) = self.pick(which) else { return Ok(()) };
                let (from, to) = (settled(from), settled(to));
                let entry = &mut self.live[i];
                let got = table.transition(entry.handle, from, to);
                if entry.state == from {
                    if got.is_err() {
                        return Err(format!("transition {from}->{to} refused: {got:?}"));
                    }
                    entry.state = to;
                } else if got
                    != Err(TableError::WrongState {
                        expected: from,
                        actual: entry.state,
                    })
                {
                    return Err(format!("transition {from}->{to} from {}: {got:?}", entry.state));
                }
            }
            TableOp::Update { which, expect, to } => {
                let Some(i) = self.pick(which) else { return Ok(()) };
                let (expect, to) = (settled(expect), settled(to));
                let entry = &mut self.live[i];
                let got = table.update(entry.handle, |s| (s == expect).then_some(to));
                if entry.state == expect {
                    if got != Ok(expect) {
                        return Err(format!("update {expect}->{to}: {got:?}"));
                    }
                    entry.state = to;
                } else if got != Err(TableError::Refused(entry.state)) {
                    return Err(format!("update expecting {expect} from {}: {got:?}", entry.state));
                }
            }
            TableOp::UseStale(which) => {
                if self.dead.is_empty() {
                    return Ok(());
                }
                let handle = self.dead[which as usize % self.dead.len()];
                let stale = |r: Result<(), TableError>| r == Err(TableError::Stale(handle));
                let checks = [
                    ("state", stale(table.state(handle).map(|_| ()))),
                    ("get", stale(table.get(handle).map(|_| ()))),
                    ("release", stale(table.release(handle).map(|_| ()))),
                    (
                        "transition",
                        stale(table.transition(handle, SocketState::Alloced, SocketState::Bound)),
                    ),
                ];
                if let Some((name, _)) = checks.iter().find(|(_, ok)| !ok) {
                    return Err(format!("{name} on dead {handle} did not fail as stale"));
                }
            }
            TableOp::Find(value) => {
                let want = self.live.iter().any(|l| l.value == value);
                let got = table.find(|v| *v == value);
                match got {
                    Some(handle) if self.live.iter().any(|l| l.handle == handle && l.value == value) => {}
                    None if !want => {}
                    _ => return Err(format!("find({value}) gave {got:?}")),
                }
            }
        }
        self.verify(table)
    }

    fn verify(&self, table: &HandleTable<u16>) -> Result<(), String> {
        if table.len() != self.live.len() {
            return Err(format!("table holds {}, model {}", table.len(), self.live.len()));
        }
        for entry in &self.live {
            match table.state(entry.handle) {
                Ok(state) if state == entry.state => {}
                other => return Err(format!("{} is {other:?}, model {}", entry.handle, entry.state)),
            }
        }
        Ok(())
    }
}

/// Run `ops` against a fresh table of `blocks` blocks and its model.
pub fn execute_and_verify(blocks: usize, ops: &[TableOp]) -> Result<(), String> {
    let table = HandleTable::new(blocks * BLOCK_SIZE);
    let mut model = TableModel::new(blocks);
    for (step, op) in ops.iter().enumerate() {
        model.apply(&table, op).map_err(|e| format!("step {step} ({op:?}): {e}"))?;
    }
    Ok(())
}
