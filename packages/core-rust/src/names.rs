//! Friendly name generation for stripes and nodes joining an activated cluster.

use std::collections::HashSet;

use rand::seq::IndexedRandom;
use rand::Rng;

use crate::model::{Cluster, Node, Stripe};
use crate::uid::Uid;

const ANIMALS: &[&str] = &[
    "aardvark", "badger", "beaver", "bison", "camel", "cheetah", "cobra", "condor", "coyote",
    "dingo", "dolphin", "eagle", "falcon", "ferret", "gazelle", "gecko", "heron", "ibis", "jaguar",
    "koala", "lemur", "lynx", "marmot", "narwhal", "ocelot", "otter", "panther", "puma", "raven",
    "tiger", "walrus", "wolf", "yak", "zebra",
];

const COLORS: &[&str] = &[
    "amber", "azure", "beige", "bronze", "cerise", "coral", "crimson", "cyan", "emerald", "fuchsia",
    "indigo", "ivory", "jade", "khaki", "lavender", "lilac", "magenta", "maroon", "mauve", "ochre",
    "olive", "scarlet", "sepia", "teal", "turquoise", "umber", "violet",
];

const SPACE: &[&str] = &[
    "andromeda", "antares", "aquila", "betelgeuse", "callisto", "carina", "cassiopeia", "ceres",
    "deneb", "europa", "ganymede", "io", "lyra", "mercury", "nebula", "neptune", "orion", "pluto",
    "polaris", "pulsar", "quasar", "rigel", "saturn", "sirius", "titan", "vega",
];

const COUNTRIES: &[&str] = &[
    "argentina", "belgium", "brazil", "canada", "chile", "denmark", "egypt", "estonia", "finland",
    "france", "ghana", "greece", "iceland", "india", "ireland", "japan", "kenya", "mexico",
    "morocco", "nepal", "norway", "peru", "portugal", "spain", "sweden", "uruguay", "vietnam",
];

const SPORTS: &[&str] = &[
    "archery", "badminton", "baseball", "biathlon", "bowling", "boxing", "cricket", "curling",
    "cycling", "diving", "fencing", "golf", "handball", "hockey", "judo", "karate", "lacrosse",
    "polo", "rowing", "rugby", "sailing", "skiing", "squash", "surfing", "tennis", "volleyball",
];

const GREEK: &[&str] = &[
    "alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta", "iota", "kappa", "lambda",
    "mu", "nu", "xi", "omicron", "pi", "rho", "sigma", "tau", "upsilon", "phi", "chi", "psi",
    "omega",
];

const DICTIONARIES: [&[&str]; 5] = [ANIMALS, COLORS, SPACE, COUNTRIES, SPORTS];

/// Default name given to a node before a friendly one is assigned.
#[must_use]
pub fn default_node_name(uid: &Uid) -> String {
    format!("node-{uid}")
}

/// Default name given to a stripe before a friendly one is assigned.
#[must_use]
pub fn default_stripe_name(uid: &Uid) -> String {
    format!("stripe-{uid}")
}

/// Picks readable stripe and node names that do not clash with existing ones.
pub struct NameGenerator<R: Rng> {
    rng: R,
}

impl<R: Rng> NameGenerator<R> {
    #[must_use]
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Names `stripe` and its nodes if their names were generated defaults.
    pub fn assign_friendly_stripe_name(&mut self, cluster: &Cluster, stripe: &mut Stripe) {
        if stripe.has_generated_name() {
            stripe.name = self.pick_stripe_name(cluster);
        }
        let mut used: HashSet<String> = cluster.nodes().map(|n| n.name.clone()).collect();
        let stripe_name = stripe.name.clone();
        for node in &mut stripe.nodes {
            if node.has_generated_name() {
                let name = self.pick_node_name(&stripe_name, &used);
                used.insert(name.clone());
                std::sync::Arc::make_mut(node).name = name;
            }
        }
    }

    /// Names `node` after the stripe it joins if its name was a generated default.
    pub fn assign_friendly_node_name(&mut self, cluster: &Cluster, stripe: &Stripe, node: &mut Node) {
        if node.has_generated_name() {
            let used: HashSet<String> = cluster.nodes().map(|n| n.name.clone()).collect();
            node.name = self.pick_node_name(&stripe.name, &used);
        }
    }

    fn pick_stripe_name(&mut self, cluster: &Cluster) -> String {
        let used: HashSet<&str> = cluster.stripes.iter().map(|s| s.name.as_str()).collect();
        // stay within the dictionary already used by the cluster, if any
        let dictionary = DICTIONARIES
            .iter()
            .find(|dict| dict.iter().any(|word| used.contains(word)))
            .copied()
            .unwrap_or_else(|| DICTIONARIES.choose(&mut self.rng).copied().unwrap_or(ANIMALS));

        let free: Vec<&str> = dictionary
            .iter()
            .copied()
            .filter(|word| !used.contains(word))
            .collect();
        if let Some(word) = free.choose(&mut self.rng) {
            return (*word).to_owned();
        }
        let base = dictionary[0];
        (1..)
            .map(|i| format!("{base}-{i}"))
            .find(|candidate| !used.contains(candidate.as_str()))
            .unwrap_or_else(|| base.to_owned())
    }

    fn pick_node_name(&mut self, stripe_name: &str, used: &HashSet<String>) -> String {
        GREEK
            .iter()
            .map(|letter| format!("{stripe_name}-{letter}"))
            .find(|candidate| !used.contains(candidate))
            .or_else(|| {
                (1..)
                    .map(|i| format!("{stripe_name}-{i}"))
                    .find(|candidate| !used.contains(candidate))
            })
            .unwrap_or_else(|| stripe_name.to_owned())
    }
}
