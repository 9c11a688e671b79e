mod tests_base;
