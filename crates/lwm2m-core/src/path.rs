//! LwM2M addressing: `ObjectId`, `InstanceId`, `ResourceId`,
//! `ResourceInstanceId`, and the `Path` they compose into.

use std::fmt;

pub type ObjectId = u16;
pub type InstanceId = u16;
pub type ResourceId = u16;
pub type ResourceInstanceId = u16;

/// A `/object[/instance[/resource[/resource-instance]]]` address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Path {
    Object(ObjectId),
    Instance(ObjectId, InstanceId),
    Resource(ObjectId, InstanceId, ResourceId),
    ResourceInstance(ObjectId, InstanceId, ResourceId, ResourceInstanceId),
}

impl Path {
    pub fn object(&self) -> ObjectId {
        match *self {
            Path::Object(o)
            | Path::Instance(o, _)
            | Path::Resource(o, _, _)
            | Path::ResourceInstance(o, _, _, _) => o,
        }
    }

    /// Parse a slash-joined sequence of decimal segments (no leading slash),
    /// as delivered by a CoAP Uri-Path option list.
    pub fn from_segments(segments: &[&str]) -> Option<Path> {
        let parse = |s: &str| s.parse::<u16>().ok();
        match segments {
            [o] => Some(Path::Object(parse(o)?)),
            [o, i] => Some(Path::Instance(parse(o)?, parse(i)?)),
            [o, i, r] => Some(Path::Resource(parse(o)?, parse(i)?, parse(r)?)),
            [o, i, r, ri] => Some(Path::ResourceInstance(
                parse(o)?,
                parse(i)?,
                parse(r)?,
                parse(ri)?,
            )),
            _ => None,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Path::Object(o) => write!(f, "/{o}"),
            Path::Instance(o, i) => write!(f, "/{o}/{i}"),
            Path::Resource(o, i, r) => write!(f, "/{o}/{i}/{r}"),
            Path::ResourceInstance(o, i, r, ri) => write!(f, "/{o}/{i}/{r}/{ri}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_four_depths() {
        assert_eq!(Path::from_segments(&["3"]), Some(Path::Object(3)));
        assert_eq!(Path::from_segments(&["3", "0"]), Some(Path::Instance(3, 0)));
        assert_eq!(
            Path::from_segments(&["3", "0", "14"]),
            Some(Path::Resource(3, 0, 14))
        );
        assert_eq!(
            Path::from_segments(&["3", "0", "6", "0"]),
            Some(Path::ResourceInstance(3, 0, 6, 0))
        );
        assert_eq!(Path::from_segments(&[]), None);
        assert_eq!(Path::from_segments(&["3", "0", "6", "0", "1"]), None);
    }

    #[test]
    fn display_round_trips_segments() {
        assert_eq!(Path::Resource(3, 0, 14).to_string(), "/3/0/14");
    }
}
