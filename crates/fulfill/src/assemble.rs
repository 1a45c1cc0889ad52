//! Order assembly: domain order -> provider order. Pure and permissive; odd input
//! degrades through defaults instead of failing.

use std::collections::BTreeMap;

use crust_core::PizzaOrder;
use tracing::debug;

use crate::{ExternalAddress, ExternalOrder, ExternalProduct, OptionAmounts};

pub const ADDRESS_TYPE: &str = "House";
pub const SIZE_SMALL: &str = "10SCREEN";
pub const SIZE_MEDIUM: &str = "12SCREEN";
pub const SIZE_LARGE: &str = "14SCREEN";
pub const CHEESE: &str = "C";
pub const SAUCE: &str = "X";

/// Product code for a size. Unknown or empty sizes fall back to large.
pub fn size_code(size: &str) -> &'static str {
    match size.trim().to_ascii_lowercase().as_str() {
        "small" => SIZE_SMALL,
        "medium" => SIZE_MEDIUM,
        "large" => SIZE_LARGE,
        _ => SIZE_LARGE,
    }
}

/// Option code for a topping, or None when the provider has no such topping.
pub fn topping_code(topping: &str) -> Option<&'static str> {
    let code = match topping.trim().to_ascii_lowercase().as_str() {
        "pepperoni" => "P",
        "sausage" => "S",
        "mushroom" => "M",
        "onion" => "O",
        "green_pepper" | "green pepper" => "G",
        "bacon" => "K",
        "beef" => "B",
        "ham" => "H",
        "pineapple" => "N",
        "spinach" => "Si",
        _ => return None,
    };
    Some(code)
}

fn whole_normal() -> OptionAmounts {
    BTreeMap::from([("1/1".to_string(), "1".to_string())])
}

pub fn assemble_order(order: &PizzaOrder, store_id: &str) -> ExternalOrder {
    let address = order.spec.address.clone().unwrap_or_default();
    let customer = order.spec.customer.clone().unwrap_or_default();

    let products = order
        .spec
        .pizzas
        .iter()
        .map(|pizza| {
            let mut options = BTreeMap::from([(CHEESE.to_string(), whole_normal()), (SAUCE.to_string(), whole_normal())]);
            for topping in &pizza.toppings {
                match topping_code(topping) {
                    Some(code) => {
                        options.insert(code.to_string(), whole_normal());
                    }
                    None => debug!(key = %order.key, topping = %topping, "skipping unknown topping"),
                }
            }
            ExternalProduct { code: size_code(&pizza.size).to_string(), qty: 1, options }
        })
        .collect();

    ExternalOrder {
        address: ExternalAddress {
            street: address.street,
            city: address.city,
            region: address.region,
            postal_code: address.postal_code,
            kind: ADDRESS_TYPE.to_string(),
        },
        customer: BTreeMap::from([
            ("FirstName".to_string(), customer.first_name),
            ("LastName".to_string(), customer.last_name),
            ("Email".to_string(), customer.email),
            ("Phone".to_string(), address.phone),
        ]),
        store_id: store_id.to_string(),
        products,
        payments: Vec::new(),
    }
}
