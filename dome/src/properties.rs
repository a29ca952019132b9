//! Dome property names and their resolution
//!
//! Drivers disagree on property names ("DOME_PARK" vs "PARK" vs
//! "TELESCOPE_PARK"). Each logical [`PropertyRole`] has an ordered list of
//! candidates which is probed once per device sync. Controllers then use
//! the resolved names directly instead of probing on every call.

use crate::link::DeviceLink;
use std::collections::HashMap;

/// Standard dome property and element names
pub mod names {
    pub const ABS_DOME_POSITION: &str = "ABS_DOME_POSITION";
    pub const DOME_ABSOLUTE_POSITION: &str = "DOME_ABSOLUTE_POSITION";
    pub const DOME_AZIMUTH: &str = "DOME_AZIMUTH";

    pub const DOME_MOTION: &str = "DOME_MOTION";
    pub const DOME_CW: &str = "DOME_CW";
    pub const DOME_CCW: &str = "DOME_CCW";
    pub const DOME_STOP: &str = "DOME_STOP";

    pub const DOME_ABORT_MOTION: &str = "DOME_ABORT_MOTION";
    pub const DOME_ABORT: &str = "DOME_ABORT";
    pub const ABORT: &str = "ABORT";

    pub const DOME_SPEED: &str = "DOME_SPEED";
    pub const DOME_SPEED_VALUE: &str = "DOME_SPEED_VALUE";

    pub const DOME_SYNC: &str = "DOME_SYNC";
    pub const DOME_SYNC_VALUE: &str = "DOME_SYNC_VALUE";

    pub const DOME_BACKLASH: &str = "DOME_BACKLASH";
    pub const DOME_BACKLASH_VALUE: &str = "DOME_BACKLASH_VALUE";

    pub const DOME_SHUTTER: &str = "DOME_SHUTTER";
    pub const SHUTTER_OPEN: &str = "SHUTTER_OPEN";
    pub const SHUTTER_CLOSE: &str = "SHUTTER_CLOSE";
    pub const SHUTTER_ABORT: &str = "SHUTTER_ABORT";

    pub const DOME_PARK: &str = "DOME_PARK";
    pub const PARK: &str = "PARK";
    pub const UNPARK: &str = "UNPARK";
    pub const TELESCOPE_PARK: &str = "TELESCOPE_PARK";

    pub const DOME_HOME: &str = "DOME_HOME";
    pub const HOME_DISCOVER: &str = "HOME_DISCOVER";
    pub const DOME_HOME_FIND: &str = "DOME_HOME_FIND";
    pub const HOME_GOTO: &str = "HOME_GOTO";
    pub const DOME_HOME_GOTO: &str = "DOME_HOME_GOTO";
    pub const HOME_SET: &str = "HOME_SET";
    pub const DOME_HOME_SET: &str = "DOME_HOME_SET";

    pub const WEATHER_PARAMETERS: &str = "WEATHER_PARAMETERS";
    pub const WEATHER_TEMPERATURE: &str = "WEATHER_TEMPERATURE";
    pub const WEATHER_HUMIDITY: &str = "WEATHER_HUMIDITY";
    pub const WEATHER_WIND_SPEED: &str = "WEATHER_WIND_SPEED";
    pub const WEATHER_STATUS: &str = "WEATHER_STATUS";
    pub const SAFETY_STATUS: &str = "SAFETY_STATUS";
    pub const WEATHER_RAIN: &str = "WEATHER_RAIN";
    pub const RAIN_ALERT: &str = "RAIN_ALERT";

    pub const DOME_PARAMS: &str = "DOME_PARAMS";
    pub const TELESCOPE_OFFSET_NS: &str = "TELESCOPE_OFFSET_NS";
    pub const TELESCOPE_OFFSET_EW: &str = "TELESCOPE_OFFSET_EW";
    pub const DOME_RADIUS: &str = "DOME_RADIUS";

    pub const HORIZONTAL_COORD: &str = "HORIZONTAL_COORD";
    pub const TELESCOPE_HORIZONTAL_COORD: &str = "TELESCOPE_HORIZONTAL_COORD";
    pub const AZ: &str = "AZ";
    pub const ALT: &str = "ALT";

    pub const DOME_AUTOSYNC: &str = "DOME_AUTOSYNC";
    pub const DOME_AUTOSYNC_ENABLE: &str = "DOME_AUTOSYNC_ENABLE";
    pub const DOME_AUTOSYNC_DISABLE: &str = "DOME_AUTOSYNC_DISABLE";
}

/// Logical dome properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyRole {
    AbsolutePosition,
    Motion,
    Abort,
    Speed,
    Sync,
    Backlash,
    Shutter,
    Park,
    HomeDiscover,
    HomeGoto,
    HomeSet,
    WeatherParameters,
    WeatherStatus,
    Rain,
    DomeParams,
    TelescopeCoord,
    AutoSync,
}

/// Which controller consumes updates of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Motion,
    Shutter,
    Parking,
    Weather,
    Telescope,
    Home,
}

impl PropertyRole {
    pub fn route_target(self) -> RouteTarget {
        match self {
            PropertyRole::AbsolutePosition
            | PropertyRole::Motion
            | PropertyRole::Abort
            | PropertyRole::Speed
            | PropertyRole::Sync
            | PropertyRole::Backlash => RouteTarget::Motion,
            PropertyRole::Shutter => RouteTarget::Shutter,
            PropertyRole::Park => RouteTarget::Parking,
            PropertyRole::HomeDiscover | PropertyRole::HomeGoto | PropertyRole::HomeSet => {
                RouteTarget::Home
            }
            PropertyRole::WeatherParameters | PropertyRole::WeatherStatus | PropertyRole::Rain => {
                RouteTarget::Weather
            }
            PropertyRole::DomeParams | PropertyRole::TelescopeCoord | PropertyRole::AutoSync => {
                RouteTarget::Telescope
            }
        }
    }
}

/// Candidate property names and elements for one role
pub struct Candidates {
    pub role: PropertyRole,
    pub properties: &'static [&'static str],
    /// Required element; the first one present wins. Empty means any.
    pub elements: &'static [&'static str],
}

use names::*;

/// Ordered candidate table, probed top to bottom per role
pub const CANDIDATES: &[Candidates] = &[
    Candidates {
        role: PropertyRole::AbsolutePosition,
        properties: &[ABS_DOME_POSITION, DOME_ABSOLUTE_POSITION, DOME_AZIMUTH],
        elements: &[],
    },
    Candidates {
        role: PropertyRole::Motion,
        properties: &[DOME_MOTION],
        elements: &[],
    },
    Candidates {
        role: PropertyRole::Abort,
        properties: &[DOME_ABORT_MOTION, DOME_ABORT],
        elements: &[ABORT],
    },
    Candidates {
        role: PropertyRole::Speed,
        properties: &[DOME_SPEED],
        elements: &[],
    },
    Candidates {
        role: PropertyRole::Sync,
        properties: &[DOME_SYNC],
        elements: &[DOME_SYNC_VALUE],
    },
    Candidates {
        role: PropertyRole::Backlash,
        properties: &[DOME_BACKLASH],
        elements: &[DOME_BACKLASH_VALUE],
    },
    Candidates {
        role: PropertyRole::Shutter,
        properties: &[DOME_SHUTTER],
        elements: &[],
    },
    Candidates {
        role: PropertyRole::Park,
        properties: &[DOME_PARK, PARK, TELESCOPE_PARK],
        elements: &[PARK],
    },
    Candidates {
        role: PropertyRole::HomeDiscover,
        properties: &[DOME_HOME, HOME_DISCOVER],
        elements: &[HOME_DISCOVER, DOME_HOME_FIND],
    },
    Candidates {
        role: PropertyRole::HomeGoto,
        properties: &[DOME_HOME, HOME_GOTO],
        elements: &[HOME_GOTO, DOME_HOME_GOTO],
    },
    Candidates {
        role: PropertyRole::HomeSet,
        properties: &[DOME_HOME, HOME_SET],
        elements: &[HOME_SET, DOME_HOME_SET],
    },
    Candidates {
        role: PropertyRole::WeatherParameters,
        properties: &[WEATHER_PARAMETERS],
        elements: &[],
    },
    Candidates {
        role: PropertyRole::WeatherStatus,
        properties: &[WEATHER_STATUS, SAFETY_STATUS],
        elements: &[],
    },
    Candidates {
        role: PropertyRole::Rain,
        properties: &[WEATHER_RAIN],
        elements: &[RAIN_ALERT],
    },
    Candidates {
        role: PropertyRole::DomeParams,
        properties: &[DOME_PARAMS],
        elements: &[],
    },
    Candidates {
        role: PropertyRole::TelescopeCoord,
        properties: &[TELESCOPE_HORIZONTAL_COORD, HORIZONTAL_COORD],
        elements: &[AZ],
    },
    Candidates {
        role: PropertyRole::AutoSync,
        properties: &[DOME_AUTOSYNC],
        elements: &[DOME_AUTOSYNC_ENABLE],
    },
];

/// A role resolved against the connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProperty {
    pub property: String,
    pub element: Option<String>,
}

/// Typed accessors for the dome's properties, resolved once per sync
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    resolved: HashMap<PropertyRole, ResolvedProperty>,
    by_name: HashMap<String, RouteTarget>,
}

impl PropertyMap {
    /// Probe the link for every role's candidates
    pub async fn resolve(link: &dyn DeviceLink) -> Self {
        let mut map = Self::default();

        for candidates in CANDIDATES {
            for name in candidates.properties {
                let Some(property) = link.get_property(name).await else {
                    continue;
                };

                let element = if candidates.elements.is_empty() {
                    None
                } else {
                    match candidates.elements.iter().find(|e| property.has_element(e)) {
                        Some(e) => Some(e.to_string()),
                        None => continue,
                    }
                };

                tracing::debug!(
                    "Resolved {:?} to {}{}",
                    candidates.role,
                    name,
                    element.as_deref().map(|e| format!(".{}", e)).unwrap_or_default()
                );
                map.insert(
                    candidates.role,
                    ResolvedProperty {
                        property: name.to_string(),
                        element,
                    },
                );
                break;
            }
        }

        map
    }

    fn insert(&mut self, role: PropertyRole, resolved: ResolvedProperty) {
        // The first role claiming a name decides its routing (DOME_HOME serves three roles)
        self.by_name
            .entry(resolved.property.clone())
            .or_insert(role.route_target());
        self.resolved.insert(role, resolved);
    }

    pub fn get(&self, role: PropertyRole) -> Option<&ResolvedProperty> {
        self.resolved.get(&role)
    }

    pub fn has(&self, role: PropertyRole) -> bool {
        self.resolved.contains_key(&role)
    }

    /// Property name for a role, if the device exposes it
    pub fn name(&self, role: PropertyRole) -> Option<&str> {
        self.get(role).map(|r| r.property.as_str())
    }

    /// Every resolved property name, for polling
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(|s| s.as_str())
    }

    /// Resolved element for a role, or `default` when the role has none
    pub fn element_or<'a>(&'a self, role: PropertyRole, default: &'a str) -> &'a str {
        self.get(role)
            .and_then(|r| r.element.as_deref())
            .unwrap_or(default)
    }

    /// Whether `name` plays `role`: the resolved name, or any candidate while unresolved
    pub fn is_role(&self, role: PropertyRole, name: &str) -> bool {
        match self.get(role) {
            Some(resolved) => resolved.property == name,
            None => CANDIDATES
                .iter()
                .filter(|c| c.role == role)
                .any(|c| c.properties.contains(&name)),
        }
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Decide which controller handles an update for `name`.
    ///
    /// Resolved names win; otherwise the name is matched by substring, and
    /// the order of checks matters ("DOME_SHUTTER" also starts with "DOME_").
    pub fn route(&self, name: &str) -> Option<RouteTarget> {
        if let Some(target) = self.by_name.get(name) {
            return Some(*target);
        }
        route_by_name(name)
    }
}

/// Fallback routing by property-name substrings
pub fn route_by_name(name: &str) -> Option<RouteTarget> {
    if name.contains("SHUTTER") {
        Some(RouteTarget::Shutter)
    } else if name.contains("PARK") {
        Some(RouteTarget::Parking)
    } else if name.contains("HOME") {
        Some(RouteTarget::Home)
    } else if name.contains("WEATHER") || name.contains("SAFETY") {
        Some(RouteTarget::Weather)
    } else if name == DOME_PARAMS || name.contains("HORIZONTAL_COORD") || name == DOME_AUTOSYNC {
        Some(RouteTarget::Telescope)
    } else if name.starts_with("DOME_") || name.starts_with("ABS_DOME") || name.starts_with("REL_DOME") {
        Some(RouteTarget::Motion)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Property;
    use crate::sim::SimulatedDome;

    #[test]
    fn test_route_by_name_precedence() {
        assert_eq!(route_by_name("DOME_SHUTTER"), Some(RouteTarget::Shutter));
        assert_eq!(route_by_name("DOME_PARK"), Some(RouteTarget::Parking));
        assert_eq!(route_by_name("DOME_HOME"), Some(RouteTarget::Home));
        assert_eq!(route_by_name("WEATHER_PARAMETERS"), Some(RouteTarget::Weather));
        assert_eq!(route_by_name("SAFETY_STATUS"), Some(RouteTarget::Weather));
        assert_eq!(route_by_name("ABS_DOME_POSITION"), Some(RouteTarget::Motion));
        assert_eq!(route_by_name("DOME_MOTION"), Some(RouteTarget::Motion));
        assert_eq!(route_by_name("DOME_PARAMS"), Some(RouteTarget::Telescope));
        assert_eq!(route_by_name("CCD_EXPOSURE"), None);
    }

    #[tokio::test]
    async fn test_resolve_against_device() {
        let sim = SimulatedDome::new("Dome Simulator");
        let map = PropertyMap::resolve(&sim).await;

        assert_eq!(map.name(PropertyRole::AbsolutePosition), Some(ABS_DOME_POSITION));
        assert_eq!(map.name(PropertyRole::Shutter), Some(DOME_SHUTTER));
        assert_eq!(
            map.get(PropertyRole::Park),
            Some(&ResolvedProperty {
                property: DOME_PARK.to_string(),
                element: Some(PARK.to_string()),
            })
        );
        assert_eq!(map.route(DOME_HOME), Some(RouteTarget::Home));
        assert!(map.is_role(PropertyRole::HomeDiscover, DOME_HOME));
        assert_eq!(map.element_or(PropertyRole::HomeGoto, HOME_GOTO), HOME_GOTO);
    }

    #[tokio::test]
    async fn test_resolve_alternative_names() {
        let sim = SimulatedDome::bare("Legacy Dome");
        sim.set_property(Property::numbers(DOME_AZIMUTH, &[("AZ", 10.0)])).await;
        sim.set_property(Property::switches(PARK, &[(PARK, false), (UNPARK, true)])).await;
        // HOME_GOTO exists but exposes no known element, so it must not resolve
        sim.set_property(Property::switches(HOME_GOTO, &[("GO", false)])).await;

        let map = PropertyMap::resolve(&sim).await;
        assert_eq!(map.name(PropertyRole::AbsolutePosition), Some(DOME_AZIMUTH));
        assert_eq!(map.name(PropertyRole::Park), Some(PARK));
        assert!(!map.has(PropertyRole::HomeGoto));
        assert!(!map.has(PropertyRole::Shutter));
        assert_eq!(map.route(DOME_AZIMUTH), Some(RouteTarget::Motion));
        assert_eq!(map.route(PARK), Some(RouteTarget::Parking));
    }
}
