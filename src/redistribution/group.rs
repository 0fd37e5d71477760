// Membership of one redistribution: which ranks feed us, which we feed.

use std::collections::HashMap;

use crate::error::{FlowError, FlowResult};

/// What the local rank does in a redistribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Only sends.
    Source,
    /// Only receives.
    Sink,
    Both,
    /// Neither sends nor receives.
    Idle,
}

/// `rank → member index` maps for sources and destinations, fixed at setup.
///
/// The local rank is never its own source or destination.
#[derive(Debug, Clone)]
pub struct RedistributionGroup {
    local_rank: usize,
    sources: Vec<usize>,
    destinations: Vec<usize>,
    source_index: HashMap<usize, usize>,
    destination_index: HashMap<usize, usize>,
}

fn index_ranks(local_rank: usize, ranks: impl IntoIterator<Item = usize>, what: &str) -> FlowResult<(Vec<usize>, HashMap<usize, usize>)> {
    let mut list = Vec::new();
    let mut index = HashMap::new();
    for rank in ranks {
        if rank == local_rank {
            continue;
        }
        if index.insert(rank, list.len()).is_some() {
            return Err(FlowError::Config(format!("rank {rank} listed twice as {what}")));
        }
        list.push(rank);
    }
    Ok((list, index))
}

impl RedistributionGroup {
    pub fn new(
        local_rank: usize,
        sources: impl IntoIterator<Item = usize>,
        destinations: impl IntoIterator<Item = usize>,
    ) -> FlowResult<Self> {
        let (sources, source_index) = index_ranks(local_rank, sources, "source")?;
        let (destinations, destination_index) = index_ranks(local_rank, destinations, "destination")?;
        Ok(Self {
            local_rank,
            sources,
            destinations,
            source_index,
            destination_index,
        })
    }

    /// Every one of `ranks` ranks exchanges with every other.
    pub fn all_to_all(local_rank: usize, ranks: usize) -> FlowResult<Self> {
        Self::new(local_rank, 0..ranks, 0..ranks)
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn sources(&self) -> &[usize] {
        &self.sources
    }

    pub fn destinations(&self) -> &[usize] {
        &self.destinations
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn num_destinations(&self) -> usize {
        self.destinations.len()
    }

    pub fn source_index(&self, rank: usize) -> Option<usize> {
        self.source_index.get(&rank).copied()
    }

    pub fn destination_index(&self, rank: usize) -> Option<usize> {
        self.destination_index.get(&rank).copied()
    }

    pub fn source_rank(&self, index: usize) -> Option<usize> {
        self.sources.get(index).copied()
    }

    pub fn destination_rank(&self, index: usize) -> Option<usize> {
        self.destinations.get(index).copied()
    }

    pub fn role(&self) -> Role {
        match (self.destinations.is_empty(), self.sources.is_empty()) {
            (false, false) => Role::Both,
            (false, true) => Role::Source,
            (true, false) => Role::Sink,
            (true, true) => Role::Idle,
        }
    }
}
