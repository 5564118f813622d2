//! Shared constants for the credential engine.

/// Default Warden HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";

/// Default base URL of the remote query API
pub const DEFAULT_API_BASE_URL: &str = "https://hlwicpfwc.miit.gov.cn/icpproject_query/api";

/// Fixed prefix mixed into the time-based authentication hash
pub const AUTH_KEY_PREFIX: &str = "testtest";

/// Prefix of the client correlation id sent with challenge requests
pub const CLIENT_UID_PREFIX: &str = "point-";

/// Retries for each of the authenticate and fetch-challenge round-trips
pub const ROUND_TRIP_ATTEMPTS: u32 = 3;

/// Caller-level attempts around a whole acquisition
pub const DEFAULT_ACQUISITION_ATTEMPTS: u32 = 5;

/// Credential TTL when serving consumer reads (3 minutes)
pub const DEFAULT_SERVE_TTL_SECS: u64 = 180;

/// Credential TTL used for the replenishment floor check
pub const DEFAULT_REPLENISH_TTL_SECS: u64 = 60;

/// Replenisher tick interval (seconds)
pub const DEFAULT_REPLENISH_INTERVAL_SECS: u64 = 5;

/// Minimum number of live credentials the replenisher maintains
pub const DEFAULT_REPLENISH_FLOOR: usize = 1;

/// Bounded join timeout when stopping the replenisher (seconds)
pub const DEFAULT_REPLENISH_JOIN_TIMEOUT_SECS: u64 = 5;

/// Query result cache TTL (30 days)
pub const DEFAULT_RESULT_TTL_SECS: u64 = 2_592_000;

/// Page size requested from the query endpoint
pub const QUERY_PAGE_SIZE: u32 = 40;

/// Query service type for website filings
pub const WEBSITE_SERVICE_TYPE: &str = "1";

/// Perception pipeline parameters
pub mod solver {
    /// Minimum class score for a detection row to be kept
    pub const CONFIDENCE_THRESHOLD: f32 = 0.7;

    /// IoU above which a lower-scoring box is suppressed
    pub const IOU_THRESHOLD: f32 = 0.7;

    /// Side of the square similarity model input
    pub const SIMILARITY_INPUT_SIDE: u32 = 105;

    /// Extra pixels added to a candidate crop's width and height
    pub const CROP_MARGIN: u32 = 2;

    /// Offset added to a matched box's top-left corner
    pub const POINT_OFFSET: i32 = 20;

    /// Reference image: x origins of the target glyph crops
    pub const GLYPH_CROP_XS: [u32; 4] = [165, 200, 231, 265];

    /// Reference image: y origin of the target glyph crops
    pub const GLYPH_CROP_Y: u32 = 11;

    /// Reference image: glyph crop width
    pub const GLYPH_CROP_WIDTH: u32 = 26;

    /// Reference image: glyph crop height
    pub const GLYPH_CROP_HEIGHT: u32 = 28;

    /// Canvas side for synthetically rendered glyphs
    pub const RENDERED_GLYPH_SIDE: u32 = 28;

    /// Background of a rendered glyph, in the channel order the model sees
    pub const RENDERED_GLYPH_BACKGROUND: [u8; 3] = [255, 143, 0];
}

/// Remote API paths, relative to the base URL
pub mod endpoints {
    pub const AUTH: &str = "/auth";
    pub const CHALLENGE: &str = "/image/getCheckImagePoint";
    pub const VERIFY: &str = "/image/checkImage";
    pub const QUERY: &str = "/icpAbbreviateInfo/queryByCondition";
}

/// HTTP header names used by the remote API
pub mod headers {
    /// Authentication token header
    pub const TOKEN: &str = "Token";

    /// Credential signature header
    pub const SIGN: &str = "Sign";

    /// Challenge id header
    pub const UUID: &str = "Uuid";

    /// Rotating continuation value (request and response)
    pub const RCI: &str = "Rci";

    /// Browser session headers sent on every request, lowercase names.
    /// The remote side's WAF checks the `__jsluid_s` cookie.
    pub const BROWSER: &[(&str, &str)] = &[
        ("cookie", "__jsluid_s=e8f856091e3de0cc6e452f8e1a188c94"),
        (
            "user-agent",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36",
        ),
        ("referer", "https://beian.miit.gov.cn/"),
        ("origin", "https://beian.miit.gov.cn"),
        ("accept", "application/json, text/plain, */*"),
        ("accept-language", "zh-CN,zh;q=0.9"),
        (
            "sec-ch-ua",
            r#"Not;A=Brand";v="99", "Google Chrome";v="139", "Chromium";v="139"#,
        ),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"macOS\""),
        ("sec-fetch-dest", "empty"),
        ("sec-fetch-mode", "cors"),
        ("sec-fetch-site", "same-site"),
        ("priority", "u=1, i"),
        ("connection", "close"),
    ];
}

/// Result cache key prefixes
pub mod redis_keys {
    /// Query result history: beian:result:{keyword}:{page}
    pub const RESULT_PREFIX: &str = "beian:result:";
}
