mod durability_test;
mod pipeline_test;
mod reconnect_test;
