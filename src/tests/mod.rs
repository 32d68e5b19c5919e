
mod test_local_budget_store;
