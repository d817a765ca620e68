use std::time::Duration;

use rand::Rng;
use typed_builder::TypedBuilder;

const UID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// How a journey picks the virtual user it runs as.
#[derive(Debug, Clone, PartialEq)]
pub enum UidMode {
    /// Every journey uses the configured fixed uid.
    Fixed,
    /// Every journey generates a fresh random uid.
    Random,
    /// Every journey draws uniformly from a pre-generated pool.
    Pool(Vec<String>),
}

/// Which scripted journey the workers execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JourneyVariant {
    /// The four-step flow.
    Standard,
    /// The four-step flow plus static-asset fetches on steps 1 and 3.
    WithStaticAssets,
}

/// Immutable run configuration, shared across all workers.
///
/// Defaults target the test tenant; override everything through the builder.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RunConfig {
    #[builder(default = "https://cdn-test.amuselabs.com/pmm/".into(), setter(into))]
    pub base_url: String,
    #[builder(default = "gandalf".into(), setter(into))]
    pub series: String,
    #[builder(default = "d4725144".into(), setter(into))]
    pub puzzle_id: String,
    #[builder(default = 185)]
    pub state_len: usize,
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    #[builder(default = "vansh".into(), setter(into))]
    pub uid: String,
    #[builder(default = UidMode::Fixed)]
    pub uid_mode: UidMode,
    #[builder(default = JourneyVariant::Standard)]
    pub variant: JourneyVariant,
    /// Prefix for the tenant-scoped static assets fetched by the
    /// with-assets variant.
    #[builder(default = "https://cdn-test.amuselabs.com/pmm/dd97891".into(), setter(into))]
    pub cdn_prefix: String,
    /// Trust any certificate and skip hostname checks. Only for
    /// self-signed test targets.
    #[builder(default = false)]
    pub insecure_tls: bool,
}

impl RunConfig {
    /// The uid for one journey invocation: fixed value, fresh random, or a
    /// uniform draw from the pool.
    pub fn choose_uid(&self) -> String {
        match &self.uid_mode {
            UidMode::Fixed => self.uid.clone(),
            UidMode::Random => generate_uid(8),
            // An empty pool degrades to the fixed uid.
            UidMode::Pool(pool) if pool.is_empty() => self.uid.clone(),
            UidMode::Pool(pool) => {
                let idx = rand::thread_rng().gen_range(0..pool.len());
                pool[idx].clone()
            }
        }
    }

    /// Base URL with a guaranteed trailing slash, so endpoint paths can be
    /// appended directly.
    pub fn base(&self) -> String {
        if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        }
    }
}

/// A random uid of `len` lowercase alphanumerics.
pub fn generate_uid(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| UID_CHARS[rng.gen_range(0..UID_CHARS.len())] as char)
        .collect()
}

/// Pre-generate a pool of `n` random uids for [`UidMode::Pool`].
pub fn generate_uid_pool(n: usize) -> Vec<String> {
    (0..n).map(|_| generate_uid(8)).collect()
}
