//! Configuration pages kept in RAM and persisted with a delay.
//!
//! Setters only touch RAM. A changed page is written to the card once it has
//! been left alone for the flush delay, so a burst of changes costs a single
//! write. After every mount the pages are read back from the card once,
//! except for pages with RAM changes that have not been written yet.

use embassy_time::{Duration, Instant};

pub use crate::fs::volume::CONFIG_PAGE_LEN;

/// Number of configuration pages
pub const CONFIG_PAGES: usize = 3;

pub type PageData = [u8; CONFIG_PAGE_LEN];

#[derive(Debug, Clone, Copy)]
struct ConfigPage {
    data: PageData,
    /// Time of the last RAM change not yet on the card
    changed_at: Option<Instant>,
    /// RAM holds the card's copy (or the card has none)
    loaded: bool,
    /// RAM content is meaningful, set by the first load or change
    known: bool,
}

impl ConfigPage {
    const fn new() -> Self {
        Self {
            data: [0; CONFIG_PAGE_LEN],
            changed_at: None,
            loaded: false,
            known: false,
        }
    }
}

#[derive(Debug)]
pub struct ConfigPages {
    pages: [ConfigPage; CONFIG_PAGES],
}

impl ConfigPages {
    pub const fn new() -> Self {
        Self {
            pages: [ConfigPage::new(), ConfigPage::new(), ConfigPage::new()],
        }
    }

    /// Replaces a page in RAM. False for an unknown page.
    pub fn set(&mut self, page: usize, data: &PageData, now: Instant) -> bool {
        let Some(p) = self.pages.get_mut(page) else {
            return false;
        };
        p.data = *data;
        p.changed_at = Some(now);
        p.known = true;
        true
    }

    /// RAM copy of a page, `None` until it was first loaded or set.
    pub fn get(&self, page: usize) -> Option<PageData> {
        let p = self.pages.get(page)?;
        p.known.then_some(p.data)
    }

    /// Page content to write if its last change is at least `delay` old.
    /// Returns the change time to pass to [`ConfigPages::flushed`].
    pub fn due(&self, page: usize, now: Instant, delay: Duration) -> Option<(PageData, Instant)> {
        let p = self.pages.get(page)?;
        let changed_at = p.changed_at?;
        (now >= changed_at + delay).then_some((p.data, changed_at))
    }

    /// The copy taken at `changed_at` is on the card now.
    pub fn flushed(&mut self, page: usize, changed_at: Instant) {
        if let Some(p) = self.pages.get_mut(page) {
            // A newer change stays pending
            if p.changed_at == Some(changed_at) {
                p.changed_at = None;
                p.loaded = true;
            }
        }
    }

    /// True if the page should be read from the card.
    pub fn needs_load(&self, page: usize) -> bool {
        self.pages
            .get(page)
            .is_some_and(|p| !p.loaded && p.changed_at.is_none())
    }

    /// Stores what was read from the card, `None` if the card had no copy.
    pub fn loaded(&mut self, page: usize, data: Option<&PageData>) {
        if let Some(p) = self.pages.get_mut(page) {
            if p.changed_at.is_some() {
                return;
            }
            if let Some(data) = data {
                p.data = *data;
            }
            p.loaded = true;
            p.known = true;
        }
    }

    /// A new medium was mounted, unchanged pages are read again.
    pub fn remounted(&mut self) {
        for p in self.pages.iter_mut() {
            p.loaded = false;
        }
    }
}

impl Default for ConfigPages {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(600_000);

    #[test]
    fn test_flush_waits_for_quiet_period() {
        let mut pages = ConfigPages::new();
        let t0 = Instant::from_millis(1_000);
        assert!(pages.set(0, &[1; CONFIG_PAGE_LEN], t0));
        assert_eq!(pages.get(0), Some([1; CONFIG_PAGE_LEN]));
        assert!(pages.due(0, t0 + Duration::from_millis(599_999), DELAY).is_none());

        let (data, changed_at) = pages
            .due(0, t0 + DELAY, DELAY)
            .expect("page is due after the delay");
        assert_eq!(data, [1; CONFIG_PAGE_LEN]);
        pages.flushed(0, changed_at);
        assert!(pages.due(0, t0 + DELAY + DELAY, DELAY).is_none());
    }

    #[test]
    fn test_change_during_flush_stays_pending() {
        let mut pages = ConfigPages::new();
        let t0 = Instant::from_millis(0);
        pages.set(1, &[1; CONFIG_PAGE_LEN], t0);
        let (_, changed_at) = pages.due(1, t0 + DELAY, DELAY).expect("due");
        pages.set(1, &[2; CONFIG_PAGE_LEN], t0 + DELAY);
        pages.flushed(1, changed_at);
        assert!(pages.due(1, t0 + DELAY + DELAY, DELAY).is_some());
    }

    #[test]
    fn test_load_does_not_clobber_pending_change() {
        let mut pages = ConfigPages::new();
        assert_eq!(pages.get(2), None);
        assert!(pages.needs_load(2));

        pages.set(2, &[7; CONFIG_PAGE_LEN], Instant::from_millis(0));
        assert!(!pages.needs_load(2));
        pages.loaded(2, Some(&[9; CONFIG_PAGE_LEN]));
        assert_eq!(pages.get(2), Some([7; CONFIG_PAGE_LEN]));
    }

    #[test]
    fn test_remount_reloads() {
        let mut pages = ConfigPages::new();
        pages.loaded(0, None);
        assert_eq!(pages.get(0), Some([0; CONFIG_PAGE_LEN]));
        pages.remounted();
        assert!(pages.needs_load(0));
        assert!(pages.get(0).is_some(), "stale copy stays readable until reloaded");
        assert!(!pages.set(3, &[0; CONFIG_PAGE_LEN], Instant::from_millis(0)));
    }
}
