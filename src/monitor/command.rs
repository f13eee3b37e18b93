use std::sync::OnceLock;
use std::time::Instant;

use rand::Rng as _;
use rand::RngCore;

use crate::monitor::pipes::CommandPipes;

/// Seconds on a monotonic clock since the process started. `last_start`
/// values and the restart-delay reset interval are measured on this clock.
pub fn monotonic_now() -> f64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// One configured `class.id` instance: the argv to run, its restart policy,
/// and the mutable backoff state carried across restarts.
///
/// A `Command` whose argv is empty failed configuration parsing and is kept
/// in the table but never launched.
#[derive(Debug)]
pub struct Command {
    pub class: String,
    pub id: u64,
    /// The instance section name, `class.id`.
    pub ssection: String,

    pub argv: Vec<String>,

    pub initial_restart_delay: u32,
    pub max_restart_delay: u32,
    pub restart_backoff: f64,
    pub restart_delay_reset_interval: u32,
    pub current_restart_delay: f64,
    /// Scheduled start time (monotonic seconds); 0 before the first launch.
    pub last_start: f64,

    pub quiet: bool,
    pub delete_wd40_env: bool,
    pub kill_on_configuration_change: bool,
    pub deconfigured: bool,

    /// Write ends of the stdout/stderr pipes, attached once the Command is
    /// adopted by the running supervisor. The read ends live in
    /// [`OutputPipes`](crate::monitor::pipes::OutputPipes); the Command holds
    /// the registration token, not the registered descriptors.
    pub pipes: Option<CommandPipes>,
}

impl Command {
    pub fn new(class: &str, id: u64) -> Command {
        Command {
            class: class.to_string(),
            id,
            ssection: format!("{class}.{id}"),
            argv: Vec::new(),
            initial_restart_delay: 0,
            max_restart_delay: 0,
            restart_backoff: 1.0,
            restart_delay_reset_interval: 0,
            current_restart_delay: 0.0,
            last_start: 0.0,
            quiet: false,
            delete_wd40_env: false,
            kill_on_configuration_change: true,
            deconfigured: false,
            pipes: None,
        }
    }

    /// Whether configuration parsing produced a runnable argv.
    pub fn launchable(&self) -> bool {
        !self.argv.is_empty()
    }

    /// Element-wise argv comparison, the trigger for kill-and-replace on
    /// reload.
    pub fn argv_differs(&self, other: &Command) -> bool {
        self.argv != other.argv
    }

    /// Copy the mutable, non-argv options from a freshly parsed candidate
    /// into this Command, keeping the accumulated backoff but clamping it
    /// into the new `[initial, max]` range.
    pub fn update_options_from(&mut self, other: &Command) {
        self.quiet = other.quiet;
        self.delete_wd40_env = other.delete_wd40_env;
        self.initial_restart_delay = other.initial_restart_delay;
        self.max_restart_delay = other.max_restart_delay;
        self.restart_backoff = other.restart_backoff;
        self.restart_delay_reset_interval = other.restart_delay_reset_interval;
        self.deconfigured = other.deconfigured;
        self.kill_on_configuration_change = other.kill_on_configuration_change;

        self.current_restart_delay = self
            .current_restart_delay
            .min(self.max_restart_delay as f64)
            .max(self.initial_restart_delay as f64);
    }

    /// Compute the delay for the next restart and advance the backoff state.
    ///
    /// If the child survived at least `restart_delay_reset_interval` seconds
    /// past its scheduled start, the delay resets to
    /// `initial_restart_delay`. The returned value carries a uniform jitter
    /// of up to 10% in either direction; afterwards the pre-jitter delay
    /// grows by `restart_backoff`, capped at `max_restart_delay`.
    pub fn next_restart_delay(&mut self, now: f64, rng: &mut dyn RngCore) -> u32 {
        if now - self.last_start >= self.restart_delay_reset_interval as f64 {
            self.current_restart_delay = self.initial_restart_delay as f64;
        }

        let lo = (-0.1 * self.current_restart_delay).floor() as i64;
        let hi = (0.1 * self.current_restart_delay).ceil() as i64;
        let jitter = rng.gen_range(lo..=hi);
        let delay = (self.current_restart_delay.round() as i64 + jitter).max(0) as u32;

        self.current_restart_delay = (self.restart_backoff * self.current_restart_delay.max(1.0))
            .min(self.max_restart_delay as f64);

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng as _;

    fn test_command(initial: u32, max: u32, backoff: f64, reset: u32) -> Command {
        let mut cmd = Command::new("worker", 1);
        cmd.argv = vec!["/bin/child".to_string()];
        cmd.initial_restart_delay = initial;
        cmd.max_restart_delay = max;
        cmd.restart_backoff = backoff;
        cmd.restart_delay_reset_interval = reset;
        cmd.current_restart_delay = initial as f64;
        cmd
    }

    #[test]
    fn backoff_progression_without_reset() {
        // initial=1, max=32, backoff=2, reset=3600: a child that dies
        // immediately seven times sees pre-jitter delays 1,2,4,8,16,32,32.
        let mut cmd = test_command(1, 32, 2.0, 3600);
        let mut rng = StdRng::seed_from_u64(7);
        let mut pre_jitter = Vec::new();
        let mut now = 10.0;
        cmd.last_start = now;
        for _ in 0..7 {
            pre_jitter.push(cmd.current_restart_delay.round() as u32);
            let delay = cmd.next_restart_delay(now, &mut rng);
            now += 0.5;
            cmd.last_start = now;
            // Jitter stays within 10% of the pre-jitter value, rounded out.
            let pre = *pre_jitter.last().unwrap() as f64;
            assert!(delay as f64 >= (0.9 * pre).floor());
            assert!(delay as f64 <= (1.1 * pre).ceil());
        }
        assert_eq!(pre_jitter, vec![1, 2, 4, 8, 16, 32, 32]);
    }

    #[test]
    fn delay_resets_after_quiet_interval() {
        let mut cmd = test_command(3, 60, 2.0, 100);
        let mut rng = StdRng::seed_from_u64(1);
        cmd.last_start = 0.0;
        let _ = cmd.next_restart_delay(1.0, &mut rng);
        let _ = cmd.next_restart_delay(2.0, &mut rng);
        assert!(cmd.current_restart_delay > 3.0);

        // Survives past the reset interval: pre-jitter delay is back to
        // initial_restart_delay for the next computation.
        cmd.last_start = 1000.0;
        let _ = cmd.next_restart_delay(1100.0, &mut rng);
        // After the post-reset computation, state has advanced exactly one
        // backoff step from the initial value.
        assert_eq!(cmd.current_restart_delay, 6.0);
    }

    #[test]
    fn backoff_of_one_keeps_delay_constant() {
        let mut cmd = test_command(5, 60, 1.0, 3600);
        let mut rng = StdRng::seed_from_u64(3);
        cmd.last_start = 50.0;
        for _ in 0..4 {
            let _ = cmd.next_restart_delay(50.0, &mut rng);
            assert_eq!(cmd.current_restart_delay, 5.0);
        }
    }

    #[test]
    fn options_update_clamps_current_delay() {
        let mut cmd = test_command(1, 64, 2.0, 3600);
        cmd.current_restart_delay = 48.0;

        let mut candidate = test_command(2, 16, 2.0, 3600);
        candidate.quiet = true;
        cmd.update_options_from(&candidate);

        assert!(cmd.quiet);
        assert_eq!(cmd.current_restart_delay, 16.0);

        cmd.current_restart_delay = 1.0;
        cmd.update_options_from(&candidate);
        assert_eq!(cmd.current_restart_delay, 2.0);
    }

    proptest! {
        #[test]
        fn delay_is_bounded(
            initial in 0u32..100,
            extra in 0u32..1000,
            backoff in 1.0f64..8.0,
            restarts in 1usize..40,
            seed in 0u64..u64::MAX,
        ) {
            let max = initial + extra;
            let mut cmd = test_command(initial, max, backoff, 3600);
            let mut rng = StdRng::seed_from_u64(seed);
            cmd.last_start = 0.0;
            for _ in 0..restarts {
                let delay = cmd.next_restart_delay(1.0, &mut rng);
                prop_assert!((delay as f64) <= (1.1 * max as f64).ceil());
            }
        }

        #[test]
        fn pre_jitter_delay_is_monotone_within_reset_interval(
            initial in 0u32..50,
            extra in 0u32..500,
            backoff in 1.0f64..8.0,
            restarts in 1usize..40,
            seed in 0u64..u64::MAX,
        ) {
            let max = initial + extra;
            let mut cmd = test_command(initial, max, backoff, 1_000_000);
            let mut rng = StdRng::seed_from_u64(seed);
            cmd.last_start = 0.0;
            let mut prev = cmd.current_restart_delay;
            for _ in 0..restarts {
                let _ = cmd.next_restart_delay(1.0, &mut rng);
                prop_assert!(cmd.current_restart_delay >= prev);
                prop_assert!(cmd.current_restart_delay <= max as f64);
                prev = cmd.current_restart_delay;
            }
        }

        #[test]
        fn surviving_past_reset_interval_restores_initial_delay(
            initial in 1u32..50,
            extra in 1u32..500,
            backoff in 1.5f64..4.0,
            seed in 0u64..u64::MAX,
        ) {
            let max = initial + extra;
            let mut cmd = test_command(initial, max, backoff, 100);
            let mut rng = StdRng::seed_from_u64(seed);

            // Accumulate some backoff with rapid failures.
            cmd.last_start = 0.0;
            for _ in 0..6 {
                let _ = cmd.next_restart_delay(1.0, &mut rng);
            }

            // A long-lived child resets the pre-jitter delay to initial; the
            // delay handed out is within jitter of it.
            cmd.last_start = 500.0;
            let delay = cmd.next_restart_delay(700.0, &mut rng);
            prop_assert!((delay as f64) >= (0.9 * initial as f64).floor());
            prop_assert!((delay as f64) <= (1.1 * initial as f64).ceil());
        }
    }
}
