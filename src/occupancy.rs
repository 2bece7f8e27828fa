//! Household occupancy flags.
//!
//! `everyone_home` and `everyone_not_home` are only ever asserted by an
//! explicit check over all household members. Each is cleared inline when a
//! single member moves the other way, so a confidence tick never triggers a
//! scan over the whole household.

use crate::types::HomeState;

/// Household flag change to publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagUpdate {
    EveryoneHome(bool),
    EveryoneNotHome(bool),
}

#[derive(Debug)]
pub struct OccupancyAggregator {
    /// Member home-state binary sensor entity ids.
    members: Vec<String>,
    everyone_home: Option<bool>,
    everyone_not_home: Option<bool>,
}

impl OccupancyAggregator {
    pub fn new(members: Vec<String>) -> Self {
        Self {
            members,
            everyone_home: None,
            everyone_not_home: None,
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_member(&self, user_sensor: &str) -> bool {
        self.members.iter().any(|m| m == user_sensor)
    }

    /// Current flag values, `None` until first known.
    pub fn everyone_home(&self) -> Option<bool> {
        self.everyone_home
    }

    pub fn everyone_not_home(&self) -> Option<bool> {
        self.everyone_not_home
    }

    /// Seed flags with values the host still holds from before a restart.
    pub fn restore(&mut self, everyone_home: Option<bool>, everyone_not_home: Option<bool>) {
        self.everyone_home = self.everyone_home.or(everyone_home);
        self.everyone_not_home = self.everyone_not_home.or(everyone_not_home);
    }

    /// A member became Home: nobody-home no longer holds.
    pub fn member_arrived(&mut self) -> Option<FlagUpdate> {
        set_flag(&mut self.everyone_not_home, false).map(FlagUpdate::EveryoneNotHome)
    }

    /// A member became Not Home: everyone-home no longer holds.
    pub fn member_departed(&mut self) -> Option<FlagUpdate> {
        set_flag(&mut self.everyone_home, false).map(FlagUpdate::EveryoneHome)
    }

    /// Assert `everyone_home` if every member with a known state is Home.
    ///
    /// `states` has one entry per member; unknown members are `None`.
    pub fn check_everyone_home<I>(&mut self, states: I) -> Option<FlagUpdate>
    where
        I: IntoIterator<Item = Option<HomeState>>,
    {
        if uniformly(states, HomeState::Home) {
            set_flag(&mut self.everyone_home, true).map(FlagUpdate::EveryoneHome)
        } else {
            None
        }
    }

    /// Assert `everyone_not_home` if every member with a known state is Not Home.
    pub fn check_everyone_not_home<I>(&mut self, states: I) -> Option<FlagUpdate>
    where
        I: IntoIterator<Item = Option<HomeState>>,
    {
        if uniformly(states, HomeState::NotHome) {
            set_flag(&mut self.everyone_not_home, true).map(FlagUpdate::EveryoneNotHome)
        } else {
            None
        }
    }
}

/// True if the known states are non-empty and all equal `target`.
/// Initializing counts as unknown.
fn uniformly<I>(states: I, target: HomeState) -> bool
where
    I: IntoIterator<Item = Option<HomeState>>,
{
    let known: Vec<HomeState> = states
        .into_iter()
        .flatten()
        .filter(|s| *s != HomeState::Initializing)
        .collect();
    !known.is_empty() && known.iter().all(|s| *s == target)
}

/// Set a flag, returning the new value only if it changed.
fn set_flag(flag: &mut Option<bool>, value: bool) -> Option<bool> {
    if *flag == Some(value) {
        None
    } else {
        *flag = Some(value);
        Some(value)
    }
}
