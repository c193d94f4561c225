//! Turns a scraped address into the ordered list of lookups to attempt.
//!
//! Addresses shaped like `"{4-digit ZIP} {city}, {street}"` get the full
//! structured cascade; anything else is looked up once as free text.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Venue tags tried against the street when the name lookup fails.
pub const DEFAULT_AMENITY_FALLBACKS: &[&str] = &["restaurant", "cafe", "bar", "fast_food", "pub"];

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{4})\s+([^,]+?)\s*,\s*(.+)$").unwrap());

static PARENS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\([^)]*\)").unwrap());

static DESCRIPTOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)[\s/,]+(?:[ivxlc]+\.\s*)?(?:block|stiege|stg\.?|top|stand|box|halle|objekt|gebäude)(?:[\s.].*)?$",
    )
    .unwrap()
});

static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:nord|süd|sued|ost|west|strombad|bahnhof|hbf\.?|ekz|einkaufszentrum|flughafen|hafen|campus|areal|messe)\s+(.+)$",
    )
    .unwrap()
});

/// An address split into its structured parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub zip: String,
    pub city: String,
    pub street: String,
}

impl ParsedAddress {
    /// Split `"1040 Wien, Rechte Wienzeile 1"` into zip, city and street.
    /// Returns `None` for any other shape.
    pub fn parse(address: &str) -> Option<Self> {
        let caps = ADDRESS_RE.captures(address.trim())?;
        let street = caps[3].trim();
        if street.is_empty() {
            return None;
        }
        Some(Self {
            zip: caps[1].to_string(),
            city: caps[2].trim().to_string(),
            street: street.to_string(),
        })
    }
}

/// Strip location prefixes, parenthesized asides and building/stand
/// descriptors from a street. Pure and deterministic.
pub fn clean_street(street: &str) -> String {
    let without_parens = PARENS_RE.replace_all(street, " ");
    let mut s = if without_parens.trim().is_empty() {
        // Nothing but an aside: keep its text, drop the brackets.
        street.replace(['(', ')'], " ")
    } else {
        without_parens.into_owned()
    };
    s = collapse(&s);

    s = DESCRIPTOR_RE.replace(&s, "").into_owned();
    if let Some(caps) = PREFIX_RE.captures(&s) {
        s = caps[1].to_string();
    }
    collapse(&s)
}

fn collapse(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| matches!(c, ',' | ';' | '/' | '-' | '–') || c.is_whitespace())
        .to_string()
}

/// Which step of the fallback cascade a query belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tier {
    /// Venue name within city and postal code.
    AmenityName,
    /// Street within city and postal code.
    Street,
    /// Street plus venue name.
    StreetAmenityName,
    /// Street plus a generic venue tag.
    StreetAmenityType(String),
    /// Street after [`clean_street`].
    CleanedStreet,
    /// The raw address as free text.
    FreeForm,
    /// City and postal code only. Results are approximate.
    CityLevel,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmenityName => write!(f, "amenity name"),
            Self::Street => write!(f, "street"),
            Self::StreetAmenityName => write!(f, "street + amenity name"),
            Self::StreetAmenityType(tag) => write!(f, "street + amenity={}", tag),
            Self::CleanedStreet => write!(f, "cleaned street"),
            Self::FreeForm => write!(f, "free-form"),
            Self::CityLevel => write!(f, "city level"),
        }
    }
}

/// Structured lookup fields. Country scoping is added by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredQuery {
    pub street: Option<String>,
    pub city: String,
    pub postalcode: String,
    pub amenity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Structured(StructuredQuery),
    FreeForm(String),
}

/// One attempt in the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocodeQuery {
    pub tier: Tier,
    pub kind: QueryKind,
}

impl GeocodeQuery {
    /// Results of this query only locate the city.
    pub fn is_approximate(&self) -> bool {
        self.tier == Tier::CityLevel
    }

    /// Query parameters in request order, without format/limit/country.
    pub fn params(&self) -> Vec<(&'static str, &str)> {
        match &self.kind {
            QueryKind::FreeForm(q) => vec![("q", q.as_str())],
            QueryKind::Structured(s) => {
                let mut params = Vec::with_capacity(4);
                if let Some(amenity) = &s.amenity {
                    params.push(("amenity", amenity.as_str()));
                }
                if let Some(street) = &s.street {
                    params.push(("street", street.as_str()));
                }
                params.push(("city", s.city.as_str()));
                params.push(("postalcode", s.postalcode.as_str()));
                params
            }
        }
    }
}

/// Builds the ordered query cascade.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    amenity_fallbacks: Vec<String>,
    city_fallback: bool,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self {
            amenity_fallbacks: DEFAULT_AMENITY_FALLBACKS.iter().map(|s| s.to_string()).collect(),
            city_fallback: true,
        }
    }
}

impl QueryBuilder {
    pub fn new(amenity_fallbacks: Vec<String>, city_fallback: bool) -> Self {
        Self { amenity_fallbacks, city_fallback }
    }

    pub fn city_fallback(&self) -> bool {
        self.city_fallback
    }

    /// Queries for `address`, most precise first.
    pub fn build(&self, address: &str, poi_name: Option<&str>) -> Vec<GeocodeQuery> {
        let poi = poi_name.map(str::trim).filter(|n| !n.is_empty());

        let Some(parsed) = ParsedAddress::parse(address) else {
            return vec![GeocodeQuery {
                tier: Tier::FreeForm,
                kind: QueryKind::FreeForm(address.trim().to_string()),
            }];
        };

        let structured = |tier: Tier, street: Option<&str>, amenity: Option<&str>| GeocodeQuery {
            tier,
            kind: QueryKind::Structured(StructuredQuery {
                street: street.map(str::to_string),
                city: parsed.city.clone(),
                postalcode: parsed.zip.clone(),
                amenity: amenity.map(str::to_string),
            }),
        };
        let street = parsed.street.as_str();

        let mut queries = Vec::with_capacity(self.amenity_fallbacks.len() + 6);
        if let Some(name) = poi {
            queries.push(structured(Tier::AmenityName, None, Some(name)));
        }
        queries.push(structured(Tier::Street, Some(street), None));
        if let Some(name) = poi {
            queries.push(structured(Tier::StreetAmenityName, Some(street), Some(name)));
        }
        for tag in &self.amenity_fallbacks {
            queries.push(structured(
                Tier::StreetAmenityType(tag.clone()),
                Some(street),
                Some(tag.as_str()),
            ));
        }

        let cleaned = clean_street(street);
        if !cleaned.is_empty() && cleaned != street {
            queries.push(structured(Tier::CleanedStreet, Some(cleaned.as_str()), None));
        }

        queries.push(GeocodeQuery {
            tier: Tier::FreeForm,
            kind: QueryKind::FreeForm(address.trim().to_string()),
        });

        if self.city_fallback {
            queries.push(structured(Tier::CityLevel, None, None));
        }
        queries
    }
}
