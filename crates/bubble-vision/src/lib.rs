mod color;
mod locator;
mod navigation;
mod template;

pub use color::{ColorCandidate, ColorProfile, ColorProfiles};
pub use locator::{anchors, BubbleLocator, BubbleRegion, LocatorConfig, SenderKind};
pub use navigation::{Marker, MarkerHit, NavigationDetector};
pub use template::{best_match, AnchorSpec, SkinSpec, TemplateHit, TemplateMatcher};
