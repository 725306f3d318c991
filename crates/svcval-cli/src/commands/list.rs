//! List command

use crate::scenario::Scenario;
use crate::scenarios::catalogue;

pub fn run() {
    print!("{}", render(&catalogue()));
}

fn render(scenarios: &[Box<dyn Scenario>]) -> String {
    let width = scenarios.iter().map(|s| s.name().len()).max().unwrap_or(0);
    scenarios
        .iter()
        .map(|s| format!("{:<width$}  {}  [{}]\n", s.name(), s.description(), s.label()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_aligned_line_per_scenario() {
        let out = render(&catalogue());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), catalogue().len());
        assert!(lines[0].starts_with("cluster-ip        "));
        assert!(lines.iter().any(|l| l.contains("[type=NodePort,externalTrafficPolicy=Local]")));
    }
}
