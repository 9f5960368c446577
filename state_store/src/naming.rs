/// Which map a machine from the provider listing belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineKind {
    Fleet,
    GoldenTemplate { template_name: String },
    Unmanaged,
}

#[derive(Debug, Clone)]
pub struct FleetNaming {
    pub fleet_prefix: String,
    pub golden_prefix: String,
}

impl Default for FleetNaming {
    fn default() -> Self {
        Self {
            fleet_prefix: "thopter-".to_string(),
            golden_prefix: "thopter-golden-".to_string(),
        }
    }
}

impl FleetNaming {
    /// The golden prefix is checked first since it may extend the fleet prefix.
    pub fn classify(&self, name: &str) -> MachineKind {
        if let Some(template_name) = name.strip_prefix(&self.golden_prefix) {
            return MachineKind::GoldenTemplate {
                template_name: template_name.to_string(),
            };
        }
        if name.starts_with(&self.fleet_prefix) {
            return MachineKind::Fleet;
        }
        MachineKind::Unmanaged
    }
}
