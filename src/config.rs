//! Store configuration.

use std::time::Duration;

/// Tunables shared by the store and the components installed on it.
///
/// All fields have defaults accessible via [`StoreConfig::default()`];
/// override individual fields with struct-update syntax.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use statefold::StoreConfig;
///
/// let config = StoreConfig {
///     replay_interval: Duration::from_millis(10),
///     ..StoreConfig::default()
/// };
/// assert_eq!(config.async_suffix, "_ASYNC");
/// assert_eq!(config.replay_interval, Duration::from_millis(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Suffix marking an action type as asynchronous.
    ///
    /// `FETCH_USER_ASYNC` expands into `FETCH_USER_LOADING` followed by
    /// `FETCH_USER_SUCCESS` or `FETCH_USER_ERROR`.
    ///
    /// Default: `"_ASYNC"`.
    pub async_suffix: String,

    /// Key under which the persistence bridge stores the serialized state.
    ///
    /// Default: `"statefold_state"`.
    pub persistence_key: String,

    /// Delay between successive actions during test-harness replay at 1x
    /// speed. The effective delay is this value divided by the speed
    /// multiplier.
    ///
    /// Default: 100 milliseconds.
    pub replay_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            async_suffix: "_ASYNC".to_string(),
            persistence_key: "statefold_state".to_string(),
            replay_interval: Duration::from_millis(100),
        }
    }
}
