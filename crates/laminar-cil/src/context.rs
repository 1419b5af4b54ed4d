//! Accounting records: per-shard contexts and the consolidated commit context.
//!
//! Busy extents are moved between these records with `Vec::append`, which
//! leaves the source empty. A handle is therefore owned by exactly one record
//! at any time.

/// Reservation carried by a commit context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ticket {
    /// Reservation consumed by the committed items, in bytes.
    pub curr_res: i64,
    /// Unit reservation accumulated from the committing transactions.
    pub unit_res: i64,
}

/// Accounting of one shard: a core slot in per-core mode, or the lone
/// shared context otherwise.
#[derive(Debug, PartialEq, Eq)]
pub struct ShardContext<B> {
    /// Reservation used.
    pub curr_res: i64,
    /// Unit reservation.
    pub unit_res: i64,
    /// Log vectors staged.
    pub nvecs: i64,
    /// Bytes of log space staged.
    pub space_used: i64,
    /// Busy extents waiting for the commit to become durable.
    pub busy_extents: Vec<B>,
}

impl<B> Default for ShardContext<B> {
    fn default() -> Self {
        Self {
            curr_res: 0,
            unit_res: 0,
            nvecs: 0,
            space_used: 0,
            busy_extents: Vec::new(),
        }
    }
}

impl<B> ShardContext<B> {
    /// Returns true if every counter is zero and no busy extent is held.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.curr_res == 0
            && self.unit_res == 0
            && self.nvecs == 0
            && self.space_used == 0
            && self.busy_extents.is_empty()
    }

    /// Adds `other` into this context, moving its busy extents.
    pub fn absorb(&mut self, mut other: Self) {
        self.curr_res += other.curr_res;
        self.unit_res += other.unit_res;
        self.nvecs += other.nvecs;
        self.space_used += other.space_used;
        self.busy_extents.append(&mut other.busy_extents);
    }

    /// Takes the contents, leaving a zeroed context behind.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// Consolidated record of one drained generation, handed to the log-write
/// pipeline.
#[derive(Debug)]
pub struct CommitContext<T, B> {
    /// Sequence the drained generation was active under.
    pub sequence: u64,
    /// Reservation gathered from every shard.
    pub ticket: Ticket,
    /// Log vectors gathered from every shard.
    pub nvecs: i64,
    /// Bytes gathered from every shard.
    pub space_used: i64,
    /// Busy extents now owned by this context.
    pub busy_extents: Vec<B>,
    /// Committed items, in per-core order. No order is implied across cores.
    pub items: Vec<T>,
}

impl<T, B> CommitContext<T, B> {
    /// Creates an empty commit context for `sequence`.
    #[must_use]
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            ticket: Ticket::default(),
            nvecs: 0,
            space_used: 0,
            busy_extents: Vec::new(),
            items: Vec::new(),
        }
    }

    /// Returns true if nothing was gathered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
            && self.busy_extents.is_empty()
            && self.nvecs == 0
            && self.space_used == 0
    }

    /// Adds a shard's counters and moves its busy extents in.
    pub(crate) fn absorb(&mut self, mut shard: ShardContext<B>) {
        self.ticket.curr_res += shard.curr_res;
        self.ticket.unit_res += shard.unit_res;
        self.nvecs += shard.nvecs;
        self.space_used += shard.space_used;
        self.busy_extents.append(&mut shard.busy_extents);
    }

    /// Overwrites the counters with a shard's and moves its busy extents in.
    pub(crate) fn assign(&mut self, mut shard: ShardContext<B>) {
        self.ticket.curr_res = shard.curr_res;
        self.ticket.unit_res = shard.unit_res;
        self.nvecs = shard.nvecs;
        self.space_used = shard.space_used;
        self.busy_extents.append(&mut shard.busy_extents);
    }
}

/// Everything one transaction commit contributes to the list.
#[derive(Debug)]
pub struct TransactionDelta<T, B> {
    /// Log items to stage.
    pub items: Vec<T>,
    /// Change in log vector count.
    pub nvecs: i64,
    /// Change in staged bytes. Negative when a relogged item shrank.
    pub len: i64,
    /// Reservation consumed.
    pub curr_res: i64,
    /// Unit reservation of the committing ticket.
    pub unit_res: i64,
    /// Busy extents released by the transaction.
    pub busy_extents: Vec<B>,
}

impl<T, B> Default for TransactionDelta<T, B> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            nvecs: 0,
            len: 0,
            curr_res: 0,
            unit_res: 0,
            busy_extents: Vec::new(),
        }
    }
}

impl<T, B> TransactionDelta<T, B> {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one log item of `len` bytes and `nvecs` vectors.
    #[must_use]
    pub fn item(mut self, item: T, len: i64, nvecs: i64) -> Self {
        self.items.push(item);
        self.len += len;
        self.nvecs += nvecs;
        self
    }

    /// Adjusts the staged byte count without adding an item.
    #[must_use]
    pub fn resize(mut self, len: i64) -> Self {
        self.len += len;
        self
    }

    /// Sets the reservation consumed by the transaction.
    #[must_use]
    pub fn reservation(mut self, curr_res: i64, unit_res: i64) -> Self {
        self.curr_res = curr_res;
        self.unit_res = unit_res;
        self
    }

    /// Hands a busy extent over to the list.
    #[must_use]
    pub fn busy(mut self, extent: B) -> Self {
        self.busy_extents.push(extent);
        self
    }

    /// Returns true if committing the delta would stage nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
            && self.busy_extents.is_empty()
            && self.nvecs == 0
            && self.len == 0
            && self.curr_res == 0
            && self.unit_res == 0
    }

    /// Splits the delta into its items and its accounting.
    pub(crate) fn into_parts(self) -> (Vec<T>, ShardContext<B>) {
        let ctx = ShardContext {
            curr_res: self.curr_res,
            unit_res: self.unit_res,
            nvecs: self.nvecs,
            space_used: self.len,
            busy_extents: self.busy_extents,
        };
        (self.items, ctx)
    }
}
