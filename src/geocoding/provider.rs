//! Reverse-geocoding providers.
//!
//! One [`GeocodingProvider`] per configured [`ProviderKind`]. Each holds its
//! own HTTP client, concurrency ceiling and circuit breaker so a slow or
//! failing provider never starves the others.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use super::circuit_breaker::CircuitBreaker;
use super::{BoundingBox, GeocodingResult};
use crate::config::ProviderConfig;
use crate::{GpsPoint, Result, TimelineError};

const USER_AGENT: &str = concat!("geotimeline/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Nominatim,
    GoogleMaps,
    Mapbox,
    Photon,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Nominatim,
        ProviderKind::GoogleMaps,
        ProviderKind::Mapbox,
        ProviderKind::Photon,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Nominatim => "nominatim",
            ProviderKind::GoogleMaps => "google_maps",
            ProviderKind::Mapbox => "mapbox",
            ProviderKind::Photon => "photon",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = TimelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "nominatim" => Ok(ProviderKind::Nominatim),
            "google" | "google_maps" | "googlemaps" => Ok(ProviderKind::GoogleMaps),
            "mapbox" => Ok(ProviderKind::Mapbox),
            "photon" => Ok(ProviderKind::Photon),
            other => Err(TimelineError::InvalidInput(format!(
                "unknown geocoding provider '{}'",
                other
            ))),
        }
    }
}

/// A configured provider with its own rate limit and breaker.
#[derive(Debug)]
pub struct GeocodingProvider {
    config: ProviderConfig,
    client: Client,
    permits: Semaphore,
    breaker: CircuitBreaker,
}

impl GeocodingProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| unavailable(config.kind, format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            permits: Semaphore::new(config.max_concurrency.max(1)),
            breaker: CircuitBreaker::new(config.kind.name(), config.breaker.clone()),
            client,
            config,
        })
    }

    pub fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Resolve a coordinate to a place description.
    ///
    /// Fails fast with `ProviderUnavailable` when the provider is disabled,
    /// lacks its API key, has no free request slot or its breaker is open. Network and parse failures
    /// count against the breaker.
    pub async fn reverse_geocode(&self, point: &GpsPoint) -> Result<GeocodingResult> {
        let kind = self.kind();
        if !self.config.enabled {
            return Err(unavailable(kind, "provider disabled"));
        }
        let url = self.request_url(point)?;
        let _permit = self
            .permits
            .try_acquire()
            .map_err(|e| unavailable(kind, format!("concurrency limit reached: {}", e)))?;
        if !self.breaker.try_acquire() {
            return Err(unavailable(kind, "circuit breaker open"));
        }

        debug!("[Geocoding] {} reverse ({}, {})", kind, point.latitude, point.longitude);
        match self.fetch(url).await.and_then(|body| parse_response(kind, &body)) {
            Ok(result) => {
                self.breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                warn!("[Geocoding] {} failed: {}", kind, e);
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn fetch(&self, url: Url) -> Result<Value> {
        let kind = self.kind();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable(kind, format!("request error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(kind, format!("HTTP {}", status)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| unavailable(kind, format!("parse error: {}", e)))
    }

    /// Reverse-geocoding URL for this provider.
    pub fn request_url(&self, point: &GpsPoint) -> Result<Url> {
        let kind = self.kind();
        let base = self.config.base_url.trim_end_matches('/');
        let lat = point.latitude.to_string();
        let lon = point.longitude.to_string();

        let parsed = match kind {
            ProviderKind::Nominatim => Url::parse_with_params(
                &format!("{}/reverse", base),
                &[
                    ("format", "jsonv2"),
                    ("lat", lat.as_str()),
                    ("lon", lon.as_str()),
                    ("zoom", "18"),
                    ("addressdetails", "1"),
                ],
            ),
            ProviderKind::Photon => Url::parse_with_params(
                &format!("{}/reverse", base),
                &[("lat", lat.as_str()), ("lon", lon.as_str())],
            ),
            ProviderKind::GoogleMaps => {
                let key = self.api_key()?;
                Url::parse_with_params(
                    &format!("{}/maps/api/geocode/json", base),
                    &[("latlng", format!("{},{}", lat, lon).as_str()), ("key", key)],
                )
            }
            ProviderKind::Mapbox => {
                let key = self.api_key()?;
                Url::parse_with_params(
                    &format!("{}/geocoding/v5/mapbox.places/{},{}.json", base, lon, lat),
                    &[("access_token", key), ("limit", "1")],
                )
            }
        };
        parsed.map_err(|e| unavailable(kind, format!("invalid base url: {}", e)))
    }

    fn api_key(&self) -> Result<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| unavailable(self.kind(), "missing API key"))
    }
}

fn unavailable(kind: ProviderKind, message: impl Into<String>) -> TimelineError {
    TimelineError::ProviderUnavailable {
        provider: kind.name().to_string(),
        message: message.into(),
    }
}

// ============================================================================
// Response parsing
// ============================================================================

/// Turn a provider's JSON body into a [`GeocodingResult`].
pub fn parse_response(kind: ProviderKind, body: &Value) -> Result<GeocodingResult> {
    let parsed = match kind {
        ProviderKind::Nominatim => parse_nominatim(body),
        ProviderKind::GoogleMaps => parse_google(body),
        ProviderKind::Mapbox => parse_mapbox(body),
        ProviderKind::Photon => parse_photon(body),
    };
    parsed.ok_or_else(|| unavailable(kind, "no usable result in response"))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str().filter(|s| !s.is_empty())
}

/// Nominatim encodes numbers as strings.
fn num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_nominatim(body: &Value) -> Option<GeocodingResult> {
    if body.get("error").is_some() {
        return None;
    }
    let display_name = str_field(body, "display_name")?;
    let result_point = GpsPoint::new(num(body.get("lat")?)?, num(body.get("lon")?)?);

    // [south, north, west, east]
    let bounding_box = body.get("boundingbox").and_then(|b| {
        let b = b.as_array()?;
        Some(BoundingBox {
            min_latitude: num(b.first()?)?,
            max_latitude: num(b.get(1)?)?,
            min_longitude: num(b.get(2)?)?,
            max_longitude: num(b.get(3)?)?,
        })
    });

    let address = body.get("address");
    let city = address.and_then(|a| {
        ["city", "town", "village", "municipality"]
            .iter()
            .find_map(|k| str_field(a, k))
    });
    let country = address.and_then(|a| str_field(a, "country"));

    Some(GeocodingResult {
        display_name: display_name.to_string(),
        result_point,
        bounding_box,
        city: city.map(str::to_string),
        country: country.map(str::to_string),
        provider_name: ProviderKind::Nominatim.name().to_string(),
    })
}

fn parse_google(body: &Value) -> Option<GeocodingResult> {
    if str_field(body, "status") != Some("OK") {
        return None;
    }
    let first = body.get("results")?.as_array()?.first()?;
    let display_name = str_field(first, "formatted_address")?;
    let geometry = first.get("geometry")?;
    let location = geometry.get("location")?;
    let result_point = GpsPoint::new(num(location.get("lat")?)?, num(location.get("lng")?)?);

    let bounding_box = geometry.get("viewport").and_then(|v| {
        let ne = v.get("northeast")?;
        let sw = v.get("southwest")?;
        Some(BoundingBox {
            min_latitude: num(sw.get("lat")?)?,
            max_latitude: num(ne.get("lat")?)?,
            min_longitude: num(sw.get("lng")?)?,
            max_longitude: num(ne.get("lng")?)?,
        })
    });

    let component = |wanted: &str| -> Option<String> {
        first
            .get("address_components")?
            .as_array()?
            .iter()
            .find(|c| {
                c.get("types")
                    .and_then(Value::as_array)
                    .is_some_and(|types| types.iter().any(|t| t.as_str() == Some(wanted)))
            })
            .and_then(|c| str_field(c, "long_name"))
            .map(str::to_string)
    };

    Some(GeocodingResult {
        display_name: display_name.to_string(),
        result_point,
        bounding_box,
        city: component("locality"),
        country: component("country"),
        provider_name: ProviderKind::GoogleMaps.name().to_string(),
    })
}

fn parse_mapbox(body: &Value) -> Option<GeocodingResult> {
    let feature = body.get("features")?.as_array()?.first()?;
    let display_name = str_field(feature, "place_name")?;
    let center = feature.get("center")?.as_array()?;
    let result_point = GpsPoint::new(num(center.get(1)?)?, num(center.first()?)?);

    // [min_lon, min_lat, max_lon, max_lat]
    let bounding_box = feature.get("bbox").and_then(|b| {
        let b = b.as_array()?;
        Some(BoundingBox {
            min_latitude: num(b.get(1)?)?,
            max_latitude: num(b.get(3)?)?,
            min_longitude: num(b.first()?)?,
            max_longitude: num(b.get(2)?)?,
        })
    });

    let context = |prefix: &str| -> Option<String> {
        feature
            .get("context")?
            .as_array()?
            .iter()
            .find(|c| str_field(c, "id").is_some_and(|id| id.starts_with(prefix)))
            .and_then(|c| str_field(c, "text"))
            .map(str::to_string)
    };

    Some(GeocodingResult {
        display_name: display_name.to_string(),
        result_point,
        bounding_box,
        city: context("place."),
        country: context("country."),
        provider_name: ProviderKind::Mapbox.name().to_string(),
    })
}

fn parse_photon(body: &Value) -> Option<GeocodingResult> {
    let feature = body.get("features")?.as_array()?.first()?;
    let props = feature.get("properties")?;
    let coords = feature.get("geometry")?.get("coordinates")?.as_array()?;
    let result_point = GpsPoint::new(num(coords.get(1)?)?, num(coords.first()?)?);

    let street = match (str_field(props, "street"), str_field(props, "housenumber")) {
        (Some(street), Some(number)) => Some(format!("{} {}", street, number)),
        (Some(street), None) => Some(street.to_string()),
        _ => None,
    };
    let city = str_field(props, "city").map(str::to_string);
    let country = str_field(props, "country").map(str::to_string);

    let parts: Vec<String> = [
        str_field(props, "name").map(str::to_string),
        street,
        city.clone(),
        country.clone(),
    ]
    .into_iter()
    .flatten()
    .collect();
    if parts.is_empty() {
        return None;
    }

    // [min_lon, max_lat, max_lon, min_lat]
    let bounding_box = props.get("extent").and_then(|b| {
        let b = b.as_array()?;
        Some(BoundingBox {
            min_latitude: num(b.get(3)?)?,
            max_latitude: num(b.get(1)?)?,
            min_longitude: num(b.first()?)?,
            max_longitude: num(b.get(2)?)?,
        })
    });

    Some(GeocodingResult {
        display_name: parts.join(", "),
        result_point,
        bounding_box,
        city,
        country,
        provider_name: ProviderKind::Photon.name().to_string(),
    })
}
