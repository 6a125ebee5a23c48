//! Platform tags for binary packages.
//!
//! Pure packages carry the generic tag and install anywhere. Packages with
//! compiled code are tagged with a `(cpu, os, version)` triple parsed from
//! strings such as `x86_64-linux` or `universal-darwin8`.
//!
//! Unknown os strings never fail to parse; they degrade to `unknown` so a
//! newer package index stays readable.

use std::fmt;
use std::str::FromStr;
use std::sync::{LazyLock, OnceLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Serialized form of [`PlatformTag::Generic`].
pub const GENERIC: &str = "ruby";

/// Serialized form of [`PlatformTag::Current`].
pub const CURRENT: &str = "current";

/// A `(cpu, os, os version)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    /// CPU family (`x86`, `x86_64`, `powerpc`, `universal`, ...). Unset for
    /// legacy os-only tags such as `java`.
    pub cpu: Option<String>,
    /// Operating system family.
    pub os: String,
    /// Operating system version, when the tag pins one.
    pub version: Option<String>,
}

type Extractor = fn(&Captures<'_>) -> (String, Option<String>);

fn group(caps: &Captures<'_>, idx: usize) -> Option<String> {
    caps.get(idx)
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}

fn compile<F: Copy>(rules: &[(&str, F)]) -> Vec<(Regex, F)> {
    rules
        .iter()
        .map(|&(pattern, extract)| {
            let re = Regex::new(pattern)
                .unwrap_or_else(|e| panic!("bad platform pattern {pattern}: {e}"));
            (re, extract)
        })
        .collect()
}

/// OS patterns, evaluated in order. First match wins.
static OS_TABLE: LazyLock<Vec<(Regex, Extractor)>> = LazyLock::new(|| {
    let rules: &[(&str, Extractor)] = &[
        (r"aix(\d+)?", |c| ("aix".into(), group(c, 1))),
        (r"cygwin", |_| ("cygwin".into(), None)),
        (r"darwin(\d+)?", |c| ("darwin".into(), group(c, 1))),
        (r"freebsd(\d+)?", |c| ("freebsd".into(), group(c, 1))),
        (r"hpux(\d+)?", |c| ("hpux".into(), group(c, 1))),
        (r"^java([\d.]*)$", |c| ("java".into(), group(c, 1))),
        (r"linux(?:-(\w+))?", |c| ("linux".into(), group(c, 1))),
        (r"mingw32", |_| ("mingw32".into(), None)),
        (r"mswin32(?:_(\d+))?", |c| ("mswin32".into(), group(c, 1))),
        (r"netbsdelf", |_| ("netbsdelf".into(), None)),
        (r"openbsd(\d+\.\d+)?", |c| ("openbsd".into(), group(c, 1))),
        (r"solaris(\d+\.\d+)?", |c| ("solaris".into(), group(c, 1))),
        // test platforms
        (r"^(\w+_platform)(\d+)?", |c| {
            (group(c, 1).unwrap_or_default(), group(c, 2))
        }),
    ];
    compile(rules)
});

type LegacyExtractor = fn(&Captures<'_>) -> Platform;

/// Historical platform strings seen in old package indexes.
static LEGACY_ALIASES: LazyLock<Vec<(Regex, LegacyExtractor)>> = LazyLock::new(|| {
    let rules: &[(&str, LegacyExtractor)] = &[
        (r"^i686-darwin(\d)$", |c| {
            Platform::from_parts(Some("x86"), "darwin", group(c, 1).as_deref())
        }),
        (r"^i\d86-linux$", |_| Platform::from_parts(Some("x86"), "linux", None)),
        (r"^(java|jruby)$", |_| Platform::from_parts(None, "java", None)),
        (r"^mswin32(?:_(\d+))?$", |c| {
            Platform::from_parts(Some("x86"), "mswin32", group(c, 1).as_deref())
        }),
        (r"^powerpc-darwin$", |_| {
            Platform::from_parts(Some("powerpc"), "darwin", None)
        }),
        (r"^powerpc-darwin(\d)$", |c| {
            Platform::from_parts(Some("powerpc"), "darwin", group(c, 1).as_deref())
        }),
        (r"^sparc-solaris2\.8$", |_| {
            Platform::from_parts(Some("sparc"), "solaris", Some("2.8"))
        }),
        (r"^universal-darwin(\d)$", |c| {
            Platform::from_parts(Some("universal"), "darwin", group(c, 1).as_deref())
        }),
    ];
    compile(rules)
});

fn lookup_os(os: &str) -> Option<(String, Option<String>)> {
    OS_TABLE
        .iter()
        .find_map(|(re, extract)| re.captures(os).map(|caps| extract(&caps)))
}

static X86_CPU: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^i\d86$").unwrap_or_else(|e| panic!("bad cpu pattern: {e}")));

static NUMERIC_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(\.\d+)?$").unwrap_or_else(|e| panic!("bad version pattern: {e}"))
});

impl Platform {
    /// Build a platform from its three parts, normalizing `iN86` cpus.
    pub fn from_parts(cpu: Option<&str>, os: &str, version: Option<&str>) -> Self {
        Self {
            cpu: cpu.map(normalize_cpu),
            os: os.to_string(),
            version: version.map(str::to_string),
        }
    }

    /// Parse a hyphenated platform string. Never fails: os names that match
    /// nothing in the table become `unknown`.
    pub fn parse(arch: &str) -> Self {
        let mut parts: Vec<String> = arch.trim().split('-').map(str::to_string).collect();

        // x86_64-linux-gnu: keep the libc suffix attached to the os
        if parts.len() > 2 {
            let last = parts.last().cloned().unwrap_or_default();
            if !NUMERIC_VERSION.is_match(&last) {
                parts.pop();
                if let Some(os) = parts.last_mut() {
                    os.push('-');
                    os.push_str(&last);
                }
            }
        }

        let mut parts = parts.into_iter();
        let first = parts.next().unwrap_or_default();
        let rest: Vec<String> = parts.collect();

        // command-line form: cpu-os-version, the explicit version wins
        if rest.len() == 2 && NUMERIC_VERSION.is_match(&rest[1]) {
            let (os, version) = match lookup_os(&rest[0]) {
                Some((os, _)) => (os, Some(rest[1].clone())),
                None => ("unknown".to_string(), None),
            };
            return Self {
                cpu: Some(normalize_cpu(&first)),
                os,
                version,
            };
        }

        // legacy os-only tags (java)
        let (cpu, os) = match rest.into_iter().next() {
            Some(os) => (Some(first), os),
            None => (None, first),
        };

        let (os, version) = lookup_os(&os).unwrap_or_else(|| ("unknown".to_string(), None));

        Self {
            cpu: cpu.as_deref().map(normalize_cpu),
            os,
            version,
        }
    }

    /// The platform this process runs on, computed once.
    pub fn local() -> &'static Platform {
        static LOCAL: OnceLock<Platform> = OnceLock::new();
        LOCAL.get_or_init(|| Platform::parse(&host_arch()))
    }

    /// Loose compatibility (`===`): a `universal` cpu on either side matches
    /// any cpu, the os must be identical, and an unset os version on either
    /// side matches any version.
    pub fn compatible(&self, other: &Platform) -> bool {
        let universal = |cpu: &Option<String>| cpu.as_deref() == Some("universal");
        let cpu_ok = universal(&self.cpu) || universal(&other.cpu) || self.cpu == other.cpu;
        let version_ok =
            self.version.is_none() || other.version.is_none() || self.version == other.version;

        cpu_ok && self.os == other.os && version_ok
    }

    /// Fuzzy match (`=~`) against a free-form platform string. Known legacy
    /// spellings are normalized first, then [`compatible`](Self::compatible)
    /// decides.
    pub fn fuzzy_matches(&self, other: &str) -> bool {
        let other = other.trim();
        let candidate = LEGACY_ALIASES
            .iter()
            .find_map(|(re, extract)| re.captures(other).map(|caps| extract(&caps)))
            .unwrap_or_else(|| Platform::parse(other));

        self.compatible(&candidate)
    }

    /// Whether a package tagged `candidate` can run on a host that supports
    /// the `known` platforms.
    ///
    /// Generic packages always match. Otherwise some known platform must be
    /// equal to the candidate or fuzzily match it.
    pub fn matches_any(candidate: &PlatformTag, known: &[PlatformTag]) -> bool {
        let Some(candidate) = candidate.resolve() else {
            return true;
        };
        let rendered = candidate.to_string();

        known.iter().any(|tag| match tag.resolve() {
            Some(platform) => platform == candidate || platform.fuzzy_matches(&rendered),
            None => false,
        })
    }

    /// `[cpu, os, version]` with unset parts as `None`.
    pub fn to_parts(&self) -> [Option<&str>; 3] {
        [
            self.cpu.as_deref(),
            Some(self.os.as_str()),
            self.version.as_deref(),
        ]
    }
}

fn normalize_cpu(cpu: &str) -> String {
    if X86_CPU.is_match(cpu) {
        "x86".to_string()
    } else {
        cpu.to_string()
    }
}

fn host_arch() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "mingw32",
        other => other,
    };
    format!("{}-{os}", std::env::consts::ARCH)
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.to_parts().into_iter().flatten().collect::<Vec<_>>().join("-");
        f.write_str(&joined)
    }
}

impl FromStr for Platform {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// The platform field of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlatformTag {
    /// A pure interpreted package with no cpu/os constraint.
    #[default]
    Generic,
    /// Placeholder for "whatever host builds or installs this"; resolved to
    /// [`Platform::local`].
    Current,
    /// A binary package for a specific platform.
    Native(Platform),
}

impl PlatformTag {
    /// Parse a serialized platform tag.
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "" | GENERIC => Self::Generic,
            CURRENT => Self::Current,
            other => Self::Native(Platform::parse(other)),
        }
    }

    /// The concrete platform, or `None` for generic packages.
    pub fn resolve(&self) -> Option<Platform> {
        match self {
            Self::Generic => None,
            Self::Current => Some(Platform::local().clone()),
            Self::Native(platform) => Some(platform.clone()),
        }
    }

    /// Whether this is the generic tag.
    pub fn is_generic(&self) -> bool {
        matches!(self, Self::Generic)
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => f.write_str(GENERIC),
            Self::Current => f.write_str(CURRENT),
            Self::Native(platform) => platform.fmt(f),
        }
    }
}

impl From<String> for PlatformTag {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<PlatformTag> for String {
    fn from(tag: PlatformTag) -> Self {
        tag.to_string()
    }
}

impl From<Platform> for PlatformTag {
    fn from(platform: Platform) -> Self {
        Self::Native(platform)
    }
}
