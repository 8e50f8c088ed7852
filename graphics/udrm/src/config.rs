//! Driver configuration

/// Mode-config limits and tunables shared by every device a node creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdrmConfig {
    /// Smallest framebuffer width accepted
    pub min_width: u32,
    /// Largest framebuffer width accepted
    pub max_width: u32,
    /// Smallest framebuffer height accepted
    pub min_height: u32,
    /// Largest framebuffer height accepted
    pub max_height: u32,
    /// Preferred color depth reported to clients
    pub preferred_depth: u32,
    /// Mode synthesised when no EDID is available
    pub default_mode: ModeSpec,
    /// Damage reports buffered per controller before new ones are dropped
    pub damage_queue_depth: usize,
}

/// Width, height and refresh rate of a mode to synthesise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSpec {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
}

impl ModeSpec {
    pub const fn new(width: u32, height: u32, refresh: u32) -> Self {
        Self {
            width,
            height,
            refresh,
        }
    }

    /// Parse `WIDTHxHEIGHT@REFRESH`, e.g. `1024x768@60`
    pub fn parse(s: &str) -> Option<Self> {
        let (size, refresh) = s.trim().split_once('@')?;
        let (width, height) = size.split_once(|c: char| c == 'x' || c == 'X')?;

        let mode = Self {
            width: width.parse().ok()?,
            height: height.parse().ok()?,
            refresh: refresh.parse().ok()?,
        };

        if mode.width == 0 || mode.height == 0 || mode.refresh == 0 {
            return None;
        }

        Some(mode)
    }
}

impl Default for UdrmConfig {
    fn default() -> Self {
        Self {
            min_width: 128,
            max_width: 4096,
            min_height: 128,
            max_height: 4096,
            preferred_depth: 24,
            default_mode: ModeSpec::new(800, 600, 60),
            damage_queue_depth: 64,
        }
    }
}

impl UdrmConfig {
    /// Defaults with `UDRM_*` environment overrides applied
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = var("UDRM_MIN_WIDTH") {
            if let Ok(n) = val.parse() {
                config.min_width = n;
            }
        }

        if let Some(val) = var("UDRM_MAX_WIDTH") {
            if let Ok(n) = val.parse() {
                config.max_width = n;
            }
        }

        if let Some(val) = var("UDRM_MIN_HEIGHT") {
            if let Ok(n) = val.parse() {
                config.min_height = n;
            }
        }

        if let Some(val) = var("UDRM_MAX_HEIGHT") {
            if let Ok(n) = val.parse() {
                config.max_height = n;
            }
        }

        if let Some(val) = var("UDRM_DEFAULT_MODE") {
            match ModeSpec::parse(&val) {
                Some(mode) => config.default_mode = mode,
                None => log::warn!("udrm: ignoring malformed UDRM_DEFAULT_MODE '{}'", val),
            }
        }

        if let Some(val) = var("UDRM_DAMAGE_QUEUE_DEPTH") {
            if let Ok(n) = val.parse::<usize>() {
                // ArrayQueue rejects a zero capacity
                config.damage_queue_depth = n.max(1);
            }
        }

        config
    }

    /// Whether a framebuffer of this size fits the mode-config limits
    pub fn fits(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }
}
