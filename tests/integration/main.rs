mod test_gateway_e2e;
