//! Stage topology for the arbitrary-radix tree allreduce.
//!
//! A radix factorization `[s_0, s_1, …]` of the regular group size splits the
//! reduce-scatter into stages. At stage `i` with running gap `g` (product of
//! the radices before it) rank `r` talks to the `s_i` ranks that share
//! `r mod g` inside its window of `g * s_i` ranks. Block ownership is striped
//! by residue: in that stage a rank owns every block `b` with
//! `b ≡ rank (mod g * s_i)`.
//!
//! `[2, 2, …, 2]` is classic recursive halving, `[n]` is a flat one-level tree.

use crate::error::{FlexError, Result};
use crate::reduce::MAX_REDUCE_INPUTS;
use std::fmt;

/// Which side of an exchange an [`OperationSet`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Blocks this rank pushes to each peer during reduce-scatter.
    Send,
    /// Blocks this rank collects from each peer during reduce-scatter.
    Recv,
}

/// Communicate `blocks` with `peer` within one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub peer: usize,
    pub blocks: Vec<usize>,
}

impl Operation {
    /// Operation carrying every block `< num_regular` congruent to `owner`
    /// modulo `window`.
    fn striped(peer: usize, owner: usize, window: usize, num_regular: usize) -> Self {
        Self {
            peer,
            blocks: owned_blocks(owner, window, num_regular),
        }
    }
}

/// Blocks owned by `owner` when ownership is striped over `window` ranks.
pub fn owned_blocks(owner: usize, window: usize, num_regular: usize) -> Vec<usize> {
    (owner % window..num_regular).step_by(window).collect()
}

/// Members of `rank`'s group in a stage with running `gap` and `radix`,
/// lowest rank first. Includes `rank` itself.
pub fn stage_group(rank: usize, gap: usize, radix: usize) -> impl Iterator<Item = usize> {
    let window = gap * radix;
    let left = rank / window * window + rank % gap;
    (0..radix).map(move |j| left + j * gap)
}

/// The per-stage operations of one role for one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSet {
    pub role: Role,
    pub rank: usize,
    pub total_peers: usize,
    pub stages: Vec<Vec<Operation>>,
    /// Exchanges with ranks outside the regular tree.
    pub lonely: Vec<Operation>,
}

impl OperationSet {
    /// Build the operation set of `role` for `rank`.
    ///
    /// # Panics
    /// If the product of `stages` differs from `total_peers - num_lonely`,
    /// if any radix is zero, or if `rank >= total_peers`. These are caller
    /// bugs; use [`StagePlan::new`] to validate untrusted factorizations.
    pub fn generate(
        role: Role,
        total_peers: usize,
        num_lonely: usize,
        rank: usize,
        stages: &[usize],
    ) -> Self {
        assert!(rank < total_peers, "rank {rank} outside {total_peers} peers");
        assert!(num_lonely < total_peers, "no regular ranks left");
        let num_regular = total_peers - num_lonely;
        assert!(
            stages.iter().all(|&s| s > 0),
            "zero radix in stages {stages:?}"
        );
        assert_eq!(
            stages.iter().product::<usize>(),
            num_regular,
            "stages {stages:?} do not factor {num_regular} regular ranks"
        );

        let mut set = Self {
            role,
            rank,
            total_peers,
            stages: Vec::with_capacity(stages.len()),
            lonely: Vec::new(),
        };

        if rank >= num_regular {
            // A lonely rank hands block i to regular rank i and later gets
            // the reduced block i back from the same rank.
            if role == Role::Send {
                set.lonely = (0..num_regular)
                    .map(|i| Operation {
                        peer: i,
                        blocks: vec![i],
                    })
                    .collect();
            }
            return set;
        }

        let mut gap = 1;
        for &radix in stages {
            let window = gap * radix;
            let ops = stage_group(rank, gap, radix)
                .map(|peer| match role {
                    Role::Send => Operation::striped(peer, peer, window, num_regular),
                    Role::Recv => Operation::striped(peer, rank, window, num_regular),
                })
                .collect();
            set.stages.push(ops);
            gap = window;
        }

        if role == Role::Recv {
            set.lonely = (num_regular..total_peers)
                .map(|l| Operation {
                    peer: l,
                    blocks: vec![rank],
                })
                .collect();
        }
        set
    }

    /// Number of regular stages.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }
}

impl fmt::Display for OperationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Send => "send",
            Role::Recv => "recv",
        };
        writeln!(
            f,
            "{role} ops of rank {} in {} peers:",
            self.rank, self.total_peers
        )?;
        for (i, ops) in self.stages.iter().enumerate() {
            let branch = if i + 1 == self.stages.len() { "└" } else { "├" };
            write!(f, "{branch} stage {i}")?;
            write_ops(f, ops)?;
        }
        if !self.lonely.is_empty() {
            write!(f, "└ lonely")?;
            write_ops(f, &self.lonely)?;
        }
        Ok(())
    }
}

fn write_ops(f: &mut fmt::Formatter<'_>, ops: &[Operation]) -> fmt::Result {
    for op in ops {
        let blocks: Vec<String> = op.blocks.iter().map(|b| b.to_string()).collect();
        write!(f, " | peer {}: {}", op.peer, blocks.join(","))?;
    }
    writeln!(f)
}

/// Send- and receive-role operation sets for one rank, built together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub send: OperationSet,
    pub recv: OperationSet,
}

impl Topology {
    pub fn generate(total_peers: usize, num_lonely: usize, rank: usize, stages: &[usize]) -> Self {
        Self {
            send: OperationSet::generate(Role::Send, total_peers, num_lonely, rank, stages),
            recv: OperationSet::generate(Role::Recv, total_peers, num_lonely, rank, stages),
        }
    }

    /// Human-readable dump of both roles.
    pub fn describe(&self) -> String {
        format!("{}{}", self.send, self.recv)
    }
}

/// A validated radix factorization plus the number of lonely ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    total_peers: usize,
    stages: Vec<usize>,
    num_lonely: usize,
}

impl StagePlan {
    /// Validate an explicit factorization.
    ///
    /// Rejects zero radices, radices above the kernel arity, a product that
    /// does not match `total_peers - num_lonely`, and lonely counts that would
    /// push the final reduction past the kernel arity.
    pub fn new(total_peers: usize, stages: Vec<usize>, num_lonely: usize) -> Result<Self> {
        if total_peers == 0 {
            return Err(FlexError::invalid_stages(&stages, "group is empty"));
        }
        if num_lonely >= total_peers {
            return Err(FlexError::invalid_stages(
                &stages,
                format!("{num_lonely} lonely ranks leave no regular group of {total_peers}"),
            ));
        }
        if stages.contains(&0) {
            return Err(FlexError::invalid_stages(&stages, "zero radix"));
        }
        if let Some(&s) = stages.iter().find(|&&s| s > MAX_REDUCE_INPUTS) {
            return Err(FlexError::invalid_stages(
                &stages,
                format!("radix {s} exceeds the {MAX_REDUCE_INPUTS}-input reduction limit"),
            ));
        }
        let num_regular = total_peers - num_lonely;
        let product: usize = stages.iter().product();
        if product != num_regular {
            return Err(FlexError::invalid_stages(
                &stages,
                format!("product {product} != {num_regular} regular ranks"),
            ));
        }
        let last = stages.last().copied().unwrap_or(1);
        if last + num_lonely > MAX_REDUCE_INPUTS {
            return Err(FlexError::invalid_stages(
                &stages,
                format!(
                    "last radix {last} plus {num_lonely} lonely ranks exceeds \
                     the {MAX_REDUCE_INPUTS}-input reduction limit"
                ),
            ));
        }
        Ok(Self {
            total_peers,
            stages,
            num_lonely,
        })
    }

    /// Single-stage flat tree over the whole group.
    pub fn flat(total_peers: usize) -> Result<Self> {
        let stages = if total_peers > 1 { vec![total_peers] } else { Vec::new() };
        Self::new(total_peers, stages, 0)
    }

    /// Choose a factorization with radices no larger than `max_radix`.
    ///
    /// Uses the fewest lonely ranks for which the regular group factors into
    /// primes `<= max_radix`, then packs those primes into as few radices as
    /// possible with the smallest radix last.
    pub fn plan(total_peers: usize, max_radix: usize) -> Result<Self> {
        let max_radix = max_radix.clamp(2, MAX_REDUCE_INPUTS);
        for num_lonely in 0..total_peers.min(MAX_REDUCE_INPUTS) {
            let num_regular = total_peers - num_lonely;
            let Some(primes) = small_prime_factors(num_regular, max_radix) else {
                continue;
            };
            if let Ok(plan) = Self::new(total_peers, pack_radices(primes, max_radix), num_lonely) {
                return Ok(plan);
            }
        }
        Err(FlexError::invalid_stages(
            &[],
            format!("no factorization of {total_peers} peers with radix <= {max_radix}"),
        ))
    }

    pub fn total_peers(&self) -> usize {
        self.total_peers
    }

    pub fn stages(&self) -> &[usize] {
        &self.stages
    }

    pub fn num_lonely(&self) -> usize {
        self.num_lonely
    }

    pub fn num_regular(&self) -> usize {
        self.total_peers - self.num_lonely
    }

    /// Build the topology of `rank` under this plan.
    pub fn topology(&self, rank: usize) -> Topology {
        Topology::generate(self.total_peers, self.num_lonely, rank, &self.stages)
    }
}

/// Prime factors of `n` (ascending) if all of them are `<= max_prime`.
fn small_prime_factors(mut n: usize, max_prime: usize) -> Option<Vec<usize>> {
    let mut primes = Vec::new();
    let mut p = 2;
    while n > 1 && p <= max_prime {
        while n % p == 0 {
            primes.push(p);
            n /= p;
        }
        p += 1;
    }
    (n == 1).then_some(primes)
}

/// First-fit-decreasing packing of prime factors into radices `<= max_radix`,
/// sorted so the smallest radix comes last.
fn pack_radices(mut primes: Vec<usize>, max_radix: usize) -> Vec<usize> {
    primes.sort_unstable_by(|a, b| b.cmp(a));
    let mut radices: Vec<usize> = Vec::new();
    for p in primes {
        match radices.iter_mut().find(|r| **r * p <= max_radix) {
            Some(r) => *r *= p,
            None => radices.push(p),
        }
    }
    radices.sort_unstable_by(|a, b| b.cmp(a));
    radices
}
